use std::collections::HashMap;
use std::fmt;

use crate::iface::FunIface;
use crate::state::{State, StateId, Step};
use crate::Error;

/// Processes one packet for a connection in one state.
///
/// Implemented for every `Fn(&mut State<C>, P, &mut FunIface<K, P, C>)` closure
/// or function returning `Result<Step<P>, Error>`, which is how protocol
/// modules usually provide them.
pub trait Handler<K, P, C>: Send + Sync {
    fn handle(
        &self,
        state: &mut State<C>,
        pkt: P,
        iface: &mut FunIface<'_, K, P, C>,
    ) -> Result<Step<P>, Error>;
}

impl<K, P, C, F> Handler<K, P, C> for F
where
    F: Fn(&mut State<C>, P, &mut FunIface<'_, K, P, C>) -> Result<Step<P>, Error> + Send + Sync,
{
    fn handle(
        &self,
        state: &mut State<C>,
        pkt: P,
        iface: &mut FunIface<'_, K, P, C>,
    ) -> Result<Step<P>, Error> {
        self(state, pkt, iface)
    }
}

/// Flat StateId to handler mapping.
pub(crate) struct Registry<K, P, C> {
    functions: HashMap<StateId, Box<dyn Handler<K, P, C>>>,
}

impl<K, P, C> Registry<K, P, C> {
    pub fn new() -> Self {
        Registry {
            functions: HashMap::new(),
        }
    }

    /// Fails with [`Error::DuplicateState`] if `id` already has a handler.
    pub fn register(&mut self, id: StateId, handler: Box<dyn Handler<K, P, C>>) -> Result<(), Error> {
        if self.functions.contains_key(&id) {
            warn!("State {} registered twice", id);
            return Err(Error::DuplicateState(id));
        }
        self.functions.insert(id, handler);
        Ok(())
    }

    pub fn get(&self, id: StateId) -> Option<&dyn Handler<K, P, C>> {
        self.functions.get(&id).map(|h| &**h)
    }

    pub fn contains(&self, id: StateId) -> bool {
        self.functions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }
}

impl<K, P, C> fmt::Debug for Registry<K, P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.functions.keys().collect();
        ids.sort();
        f.debug_struct("Registry").field("states", &ids).finish()
    }
}
