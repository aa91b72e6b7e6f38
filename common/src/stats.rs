use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::NodeId;

/// Métricas de un host durante una sesión.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostTaskStats {
    pub host: NodeId,
    pub internal: bool,
    pub tasks_executed: u64,
    pub total_execute_ms: u64,
}

impl HostTaskStats {
    pub fn new(host: NodeId, internal: bool) -> Self {
        Self {
            host,
            internal,
            ..Default::default()
        }
    }

    pub fn record(&mut self, execute_ms: u64) {
        self.tasks_executed += 1;
        self.total_execute_ms += execute_ms;
    }

    pub fn avg_task_ms(&self) -> Option<f64> {
        if self.tasks_executed > 0 {
            Some(self.total_execute_ms as f64 / self.tasks_executed as f64)
        } else {
            None
        }
    }
}

/// Métricas de un servidor de tareas y de su subárbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceTaskStats {
    pub task_server: NodeId,
    pub hosts: Vec<HostTaskStats>,
    pub children: Vec<ServiceTaskStats>,
}

impl ServiceTaskStats {
    pub fn new(task_server: NodeId, hosts: Vec<HostTaskStats>) -> Self {
        Self {
            task_server,
            hosts,
            children: Vec::new(),
        }
    }

    pub fn add_child(&mut self, child: ServiceTaskStats) {
        self.children.push(child);
    }

    pub fn tasks_executed(&self) -> u64 {
        self.hosts.iter().map(|h| h.tasks_executed).sum::<u64>()
            + self.children.iter().map(|c| c.tasks_executed()).sum::<u64>()
    }

    pub fn total_execute_ms(&self) -> u64 {
        self.hosts.iter().map(|h| h.total_execute_ms).sum::<u64>()
            + self.children.iter().map(|c| c.total_execute_ms()).sum::<u64>()
    }

    pub fn servers(&self) -> usize {
        1 + self.children.iter().map(|c| c.servers()).sum::<usize>()
    }
}

/// Lo que recibe el cliente al cerrar sesión.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub session_id: i64,
    pub client: String,
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub computations: u32,
    pub stats: Option<ServiceTaskStats>,
}

impl Invoice {
    pub fn tasks_executed(&self) -> u64 {
        self.stats.as_ref().map_or(0, |s| s.tasks_executed())
    }

    pub fn elapsed_ms(&self) -> i64 {
        (self.end - self.begin).num_milliseconds()
    }
}

impl fmt::Display for Invoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sesión {} ({})", self.session_id, self.client)?;
        writeln!(f, "  inicio     : {}", self.begin)?;
        writeln!(f, "  fin        : {}", self.end)?;
        writeln!(f, "  duración   : {} ms", self.elapsed_ms())?;
        writeln!(f, "  cómputos   : {}", self.computations)?;
        write!(f, "  tareas     : {}", self.tasks_executed())?;
        if let Some(stats) = &self.stats {
            write!(
                f,
                "\n  servidores : {}\n  cpu total  : {} ms",
                stats.servers(),
                stats.total_execute_ms()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cuenta_tareas_de_todo_el_subarbol() {
        let mut h1 = HostTaskStats::new("h1".into(), false);
        h1.record(10);
        h1.record(30);
        let mut h2 = HostTaskStats::new("h2".into(), false);
        h2.record(5);

        let mut root = ServiceTaskStats::new("ts-0".into(), vec![h1.clone()]);
        root.add_child(ServiceTaskStats::new("ts-1".into(), vec![h2]));

        assert_eq!(root.tasks_executed(), 3);
        assert_eq!(root.total_execute_ms(), 45);
        assert_eq!(root.servers(), 2);
        assert_eq!(h1.avg_task_ms(), Some(20.0));
    }
}
