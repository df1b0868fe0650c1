use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

use crate::engine::datatype::Registry;
use crate::engine::task::{ExecutionStatus, TaskExecution};
use crate::key::CacheKey;

/// Task execution metrics of an environment.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    pub executions: Vec<TaskExecution>,
}

/// Production time accumulated by one data type.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct TypeSummary {
    pub finished: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: Duration,
}

impl Diagnostics {
    pub fn new(executions: &[TaskExecution]) -> Self {
        Self {
            executions: executions.to_vec(),
        }
    }

    /// Executions grouped by the data type of the key they produced. Tasks
    /// that aren't keyed by a cache key are left out.
    pub fn by_data_type(&self) -> HashMap<String, TypeSummary> {
        let mut summary: HashMap<String, TypeSummary> = HashMap::new();

        for execution in &self.executions {
            let Ok(key) = execution.id.as_str().parse::<CacheKey>() else {
                continue;
            };

            let entry = summary.entry(key.data_type().to_string()).or_default();
            entry.total += execution.duration;
            match execution.status {
                ExecutionStatus::Finished => entry.finished += 1,
                ExecutionStatus::Failed => entry.failed += 1,
                ExecutionStatus::Cancelled => entry.cancelled += 1,
            }
        }

        summary
    }

    /// Renders the data type graph as a Mermaid diagram, color-coded by
    /// accumulated production time.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Never produced
    pub fn render_mermaid(&self, registry: &Registry) -> String {
        let summary = self.by_data_type();

        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;
        for s in summary.values() {
            let secs = s.total.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for data_type in registry.iter() {
            let name = data_type.name().replace('"', "\\\"");

            let (label, color) = match summary.get(data_type.key()) {
                Some(s) => {
                    let t = (s.total.as_secs_f64() - min_time) / (max_time - min_time);

                    // green to yellow to red
                    let (r, g) = if t < 0.5 {
                        ((255.0 * t * 2.0) as u8, 255)
                    } else {
                        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
                    };

                    let mut label = format!("{:.2?}", s.total);
                    if s.failed > 0 {
                        let _ = write!(label, ", {} failed", s.failed);
                    }
                    (label, format!("#{r:02X}{g:02X}00"))
                }
                None => ("not produced".to_string(), "#ADD8E6".to_string()),
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", data_type.key(), name, label);
            let _ = writeln!(f, "    style {} fill:{}", data_type.key(), color);
        }

        for data_type in registry.iter() {
            for dependency in data_type.dependencies() {
                let _ = writeln!(f, "    {} --> {}", dependency, data_type.key());
            }
        }

        f
    }
}
