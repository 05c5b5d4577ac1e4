pub mod config;
pub mod error;
pub mod evaluator;
pub mod mesh;
pub mod points;
pub mod protocol;
pub mod report;

pub use config::{ClusterConfig, TlsConfig};
pub use error::{Error, Result};
pub use evaluator::{Evaluation, Evaluator, Truncate};
pub use mesh::{Communicator, Rank, COORDINATOR};
pub use protocol::{run_rank, simulate, Outcome};
pub use report::{EvaluationResult, Report};
