use async_trait::async_trait;

use crate::coordinator::Coordinator;
use crate::error::Result;

mod set;

pub use set::SetStatement;

/// A unit of a test script
#[async_trait]
pub trait Statement: Send + Sync {
    /// Assign the identifier results of this statement are tagged with
    fn set_id(&mut self, id: &str);

    /// Execute the statement against the coordinator
    async fn run(&mut self, coordinator: &Coordinator) -> Result<()>;

    /// Describe what the statement did
    fn report(&self, coordinator: &Coordinator) -> String;
}
