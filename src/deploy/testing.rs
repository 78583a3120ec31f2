use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;

use crate::docker::{
    ActualService, ContainerControl, ContainerRequest, HealthState, SwarmServiceRequest,
};
use crate::error::TakoError;

/// In-memory `ContainerControl` for tests: scripts health probes and
/// replica reports, records every operation for assertions.
#[derive(Default)]
pub struct FakeControl {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    ops: Vec<String>,
    services: Vec<ActualService>,
    health: BTreeMap<String, VecDeque<HealthState>>,
    health_cycle: BTreeMap<String, Vec<HealthState>>,
    health_cycle_pos: BTreeMap<String, usize>,
    replicas: BTreeMap<String, VecDeque<(u32, u32)>>,
    http_ok: bool,
    fail_ops: Vec<String>,
}

impl FakeControl {
    pub fn script_health(&self, container: &str, states: &[HealthState]) {
        self.inner
            .lock()
            .unwrap()
            .health
            .insert(container.to_string(), states.iter().copied().collect());
    }

    /// After any one-shot script runs out, cycle these states forever.
    pub fn script_health_cycle(&self, container: &str, states: &[HealthState]) {
        self.inner
            .lock()
            .unwrap()
            .health_cycle
            .insert(container.to_string(), states.to_vec());
    }

    pub fn set_services(&self, services: Vec<ActualService>) {
        self.inner.lock().unwrap().services = services;
    }

    pub fn script_replicas(&self, service: &str, reports: &[(u32, u32)]) {
        self.inner
            .lock()
            .unwrap()
            .replicas
            .insert(service.to_string(), reports.iter().copied().collect());
    }

    pub fn set_http_ok(&self, ok: bool) {
        self.inner.lock().unwrap().http_ok = ok;
    }

    /// Make any op whose log line starts with this prefix fail.
    pub fn fail_on(&self, prefix: &str) {
        self.inner.lock().unwrap().fail_ops.push(prefix.to_string());
    }

    pub fn ops(&self) -> Vec<String> {
        self.inner.lock().unwrap().ops.clone()
    }

    fn record(&self, op: String) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let fails = inner.fail_ops.iter().any(|p| op.starts_with(p.as_str()));
        inner.ops.push(op.clone());
        if fails {
            return Err(TakoError::RemoteExec {
                exit_code: 1,
                stderr: format!("injected failure for {}", op),
            }
            .into());
        }
        Ok(())
    }
}

impl ContainerControl for FakeControl {
    async fn host_command(&self, cmd: &str) -> Result<String> {
        self.record(format!("host {}", cmd))?;
        Ok(String::new())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        self.record(format!("network {}", name))
    }

    async fn create_container(&self, req: &ContainerRequest) -> Result<String> {
        self.record(format!("create {} {}", req.name, req.image))?;
        Ok(format!("id-{}", req.name))
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        self.record(format!("start {}", name))
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.record(format!("stop {}", name))
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.record(format!("remove {}", name))
    }

    async fn exec(&self, container: &str, cmd: &str) -> Result<String> {
        self.record(format!("exec {} {}", container, cmd))?;
        Ok(String::new())
    }

    async fn container_health(&self, name: &str) -> Result<HealthState> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(queue) = inner.health.get_mut(name) {
            if let Some(state) = queue.pop_front() {
                return Ok(state);
            }
        }
        if let Some(cycle) = inner.health_cycle.get(name).cloned() {
            if !cycle.is_empty() {
                let pos = inner.health_cycle_pos.entry(name.to_string()).or_insert(0);
                let state = cycle[*pos % cycle.len()];
                *pos += 1;
                return Ok(state);
            }
        }
        Ok(HealthState::None)
    }

    async fn http_probe(&self, url: &str) -> Result<bool> {
        let ok = self.inner.lock().unwrap().http_ok;
        self.record(format!("probe {}", url))?;
        Ok(ok)
    }

    async fn list_services(&self, _project: &str, _env: &str) -> Result<Vec<ActualService>> {
        Ok(self.inner.lock().unwrap().services.clone())
    }

    async fn create_service(&self, req: &SwarmServiceRequest) -> Result<()> {
        self.record(format!("service-create {} {}", req.name, req.image))
    }

    async fn update_service(&self, req: &SwarmServiceRequest) -> Result<()> {
        self.record(format!("service-update {} {}", req.name, req.image))
    }

    async fn scale_service(&self, name: &str, replicas: u32) -> Result<()> {
        self.record(format!("service-scale {}={}", name, replicas))
    }

    async fn remove_service(&self, name: &str) -> Result<()> {
        self.record(format!("service-remove {}", name))
    }

    async fn rollback_service(&self, name: &str) -> Result<()> {
        self.record(format!("service-rollback {}", name))
    }

    async fn service_replicas(&self, name: &str) -> Result<(u32, u32)> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(queue) = inner.replicas.get_mut(name) {
            if queue.len() > 1 {
                return Ok(queue.pop_front().unwrap());
            }
            if let Some(report) = queue.front() {
                return Ok(*report);
            }
        }
        Ok((0, 0))
    }
}
