use crate::Error;

/// State machine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    shards: usize,
    workers: usize,
    max_timeouts: usize,
    shard_capacity: usize,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            shards: 64,
            workers: 1,
            max_timeouts: 65536,
            shard_capacity: 0,
        }
    }

    /// Number of shards of the state table.
    ///
    /// Each shard has its own lock. Identities are spread by hash.
    #[inline(always)]
    pub fn shards(&self) -> usize {
        self.shards
    }

    /// Number of threads a batch is dispatched on.
    ///
    /// With 1 the batch runs on the calling thread.
    #[inline(always)]
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Max number of armed handler timeouts.
    ///
    /// Further `set_timeout` requests are ignored until some fire or
    /// get cancelled.
    #[inline(always)]
    pub fn max_timeouts(&self) -> usize {
        self.max_timeouts
    }

    /// Initial capacity of each shard's map.
    #[inline(always)]
    pub fn shard_capacity(&self) -> usize {
        self.shard_capacity
    }
}

/// Builder for state machine configuration.
#[derive(Debug)]
pub struct ConfigBuilder {
    shards: usize,
    workers: usize,
    max_timeouts: usize,
    shard_capacity: usize,
}

impl ConfigBuilder {
    /// Set the number of state table shards.
    ///
    /// Defaults to 64.
    pub fn shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Set the number of dispatch threads per batch.
    ///
    /// Packets of one connection always land on the same thread, in batch
    /// order. Defaults to 1.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the max number of armed timeouts.
    ///
    /// Defaults to 65536.
    pub fn max_timeouts(mut self, max: usize) -> Self {
        self.max_timeouts = max;
        self
    }

    /// Preallocate room for this many connections per shard.
    ///
    /// Defaults to 0.
    pub fn shard_capacity(mut self, capacity: usize) -> Self {
        self.shard_capacity = capacity;
        self
    }

    /// Build the configuration.
    ///
    /// Returns `Error::Config` if `shards` or `workers` is zero.
    pub fn build(self) -> Result<Config, Error> {
        if self.shards == 0 {
            return Err(Error::Config("shards must be at least 1".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be at least 1".into()));
        }

        Ok(Config {
            shards: self.shards,
            workers: self.workers,
            max_timeouts: self.max_timeouts,
            shard_capacity: self.shard_capacity,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        let b = Config::builder();
        Config {
            shards: b.shards,
            workers: b.workers,
            max_timeouts: b.max_timeouts,
            shard_capacity: b.shard_capacity,
        }
    }
}
