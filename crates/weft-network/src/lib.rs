mod endpoints;
mod reactor;

pub use endpoints::Endpoints;
pub use reactor::{LoopState, Reactor};
