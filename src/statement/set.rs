use async_trait::async_trait;
use log::{debug, info};
use std::collections::BTreeMap;

use super::Statement;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::message::{Directive, PropertyScope};
use crate::point::Precision;
use crate::tracer::Tracer;

/// Sets a test-state variable, e.g. `SET precision = 'ms'`
#[derive(Debug, Clone)]
pub struct SetStatement {
    pub var: String,
    pub value: String,
    pub statement_id: String,
    tracer: Option<Tracer>,
}

impl SetStatement {
    pub fn new(var: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            value: value.into(),
            statement_id: String::new(),
            tracer: None,
        }
    }

    /// The tracer used by the last run
    pub fn tracer(&self) -> Option<&Tracer> {
        self.tracer.as_ref()
    }
}

#[async_trait]
impl Statement for SetStatement {
    fn set_id(&mut self, id: &str) {
        self.statement_id = id.to_string();
    }

    async fn run(&mut self, coordinator: &Coordinator) -> Result<()> {
        let mut tags = BTreeMap::new();
        tags.insert("statement_id".to_string(), self.statement_id.clone());
        let tracer = Tracer::new(tags);
        self.tracer = Some(tracer.clone());

        let directive = Directive::new(&self.var, self.value.to_lowercase(), tracer.clone());
        let scope = directive.scope();
        debug!("SET {} = '{}' ({:?})", directive.property, directive.value, scope);

        match scope {
            PropertyScope::Both => {
                // precision is the only shared property. It is applied locally
                // only once the worker pool has accepted it.
                let value = directive.value.clone();
                value.parse::<Precision>()?;
                tracer.add(1);
                coordinator.send_directive(directive).await?;
                coordinator.set_precision(&value)?;
            }
            PropertyScope::Local => match directive.property.as_str() {
                "startdate" => {
                    coordinator.set_start_date(&directive.value)?;
                }
                _ => {
                    coordinator.set_batch_size(&directive.value)?;
                }
            },
            PropertyScope::Downstream => {
                tracer.add(1);
                coordinator.send_directive(directive).await?;
            }
        }

        tracer.wait().await;
        info!("{}", self.report(coordinator));
        Ok(())
    }

    fn report(&self, _coordinator: &Coordinator) -> String {
        format!("SET {} = '{}'", self.var, self.value)
    }
}
