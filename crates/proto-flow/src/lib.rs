pub mod capture;
pub mod flow;
pub mod materialize;

mod combiner;
pub use combiner::{Combiner, DrainStats, DrainedDoc};

mod validate;
pub use validate::ValidateError;
