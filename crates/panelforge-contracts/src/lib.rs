pub mod artifacts;
pub mod batch;
pub mod events;
pub mod naming;
pub mod script;
pub mod styles;
