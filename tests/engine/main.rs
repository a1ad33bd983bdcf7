
mod builder;
mod props;
mod timeout;
