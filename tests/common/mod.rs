//! Shared fixtures for integration tests.
//!
//! `FakeTools` stands in for all four external tools. Failures, delays and
//! rollback outcomes are scripted per stage name; every call is recorded.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use shipyard::adapters::{
    AdapterError, AdapterSet, BuildSpec, Builder, CancelSignal, Capability, ConfigReport,
    Configurator, Deployer, ManifestSpec, PlanInput, PlaybookSpec, Provisioner, ResourceSet,
    RollbackRequest, RolloutStatus, StageInput,
};
use shipyard::core::{
    AdapterKind, CollectingNotifier, Engine, PipelineDefinition, RetryPolicy, RunStore, StageSpec,
};
use shipyard::domain::{ArtifactRef, LifecycleEvent};

#[derive(Default)]
pub struct FakeTools {
    calls: Mutex<Vec<String>>,
    rollbacks: Mutex<Vec<String>>,
    transient: Mutex<HashMap<String, u32>>,
    permanent: Mutex<HashMap<String, AdapterError>>,
    failing_rollbacks: Mutex<HashSet<String>>,
    delays: Mutex<HashMap<String, Duration>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeTools {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the first `times` attempts of `stage`
    pub fn fail_times(&self, stage: &str, times: u32) {
        self.transient.lock().unwrap().insert(stage.to_string(), times);
    }

    /// Fail every attempt of `stage` with a retriable capability error
    pub fn fail_always(&self, stage: &str, capability: Capability) {
        self.fail_with(stage, AdapterError::failure(capability, format!("{} is broken", stage)));
    }

    pub fn fail_with(&self, stage: &str, error: AdapterError) {
        self.permanent
            .lock()
            .unwrap()
            .insert(stage.to_string(), error);
    }

    pub fn fail_rollback(&self, stage: &str) {
        self.failing_rollbacks
            .lock()
            .unwrap()
            .insert(stage.to_string());
    }

    pub fn delay(&self, stage: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(stage.to_string(), delay);
    }

    /// Stage names in call order, one entry per attempt
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, stage: &str) -> usize {
        self.calls().iter().filter(|c| *c == stage).count()
    }

    /// Stages whose rollback was invoked, in call order
    pub fn rollbacks(&self) -> Vec<String> {
        self.rollbacks.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn adapter_set(self: &Arc<Self>) -> AdapterSet {
        AdapterSet::new()
            .with_provisioner(self.clone())
            .with_builder(self.clone())
            .with_deployer(self.clone())
            .with_configurator(self.clone())
    }

    async fn perform(
        &self,
        input: &StageInput,
        cancel: &CancelSignal,
    ) -> Result<(), AdapterError> {
        self.calls.lock().unwrap().push(input.stage.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.lock().unwrap().get(&input.stage).copied();
        let outcome = match delay {
            Some(delay) => tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(()),
                _ = cancel.cancelled() => Err(AdapterError::Cancelled),
            },
            None => Ok(()),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome?;

        if let Some(error) = self.permanent.lock().unwrap().get(&input.stage) {
            return Err(error.clone());
        }

        let mut transient = self.transient.lock().unwrap();
        if let Some(remaining) = transient.get_mut(&input.stage) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AdapterError::failure(
                    input.kind.capability(),
                    format!("{} flaked on attempt {}", input.stage, input.attempt),
                ));
            }
        }

        Ok(())
    }

    fn roll_back(&self, request: &RollbackRequest) -> Result<(), AdapterError> {
        self.rollbacks.lock().unwrap().push(request.stage.clone());
        if self.failing_rollbacks.lock().unwrap().contains(&request.stage) {
            return Err(AdapterError::failure(
                request.kind.capability(),
                format!("cannot undo {}", request.stage),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for FakeTools {
    async fn apply(&self, plan: &PlanInput, cancel: &CancelSignal) -> Result<ResourceSet, AdapterError> {
        self.perform(plan, cancel).await?;
        Ok(ResourceSet {
            handle: format!("{}-inventory", plan.stage),
            resources: vec!["vm-1".into(), "vm-2".into()],
        })
    }

    async fn rollback(&self, request: &RollbackRequest, _cancel: &CancelSignal) -> Result<(), AdapterError> {
        self.roll_back(request)
    }
}

#[async_trait]
impl Builder for FakeTools {
    async fn build(&self, spec: &BuildSpec, cancel: &CancelSignal) -> Result<ArtifactRef, AdapterError> {
        self.perform(spec, cancel).await?;
        Ok(ArtifactRef::new(format!("image:{}", spec.trigger.commit)))
    }

    async fn push(
        &self,
        artifact: &ArtifactRef,
        spec: &BuildSpec,
        cancel: &CancelSignal,
    ) -> Result<ArtifactRef, AdapterError> {
        self.perform(spec, cancel).await?;
        Ok(ArtifactRef::new(format!("registry.local/{}", artifact)))
    }

    async fn rollback(&self, request: &RollbackRequest, _cancel: &CancelSignal) -> Result<(), AdapterError> {
        self.roll_back(request)
    }
}

#[async_trait]
impl Deployer for FakeTools {
    async fn deploy(
        &self,
        artifact: &ArtifactRef,
        manifest: &ManifestSpec,
        cancel: &CancelSignal,
    ) -> Result<RolloutStatus, AdapterError> {
        self.perform(manifest, cancel).await?;
        Ok(RolloutStatus {
            revision: format!("{}@rev{}", artifact, manifest.attempt),
            message: "rolled out".into(),
        })
    }

    async fn rollback(&self, request: &RollbackRequest, _cancel: &CancelSignal) -> Result<(), AdapterError> {
        self.roll_back(request)
    }
}

#[async_trait]
impl Configurator for FakeTools {
    async fn configure(
        &self,
        targets: &[String],
        playbook: &PlaybookSpec,
        cancel: &CancelSignal,
    ) -> Result<ConfigReport, AdapterError> {
        self.perform(playbook, cancel).await?;
        Ok(ConfigReport {
            targets: targets.to_vec(),
            summary: "ok".into(),
        })
    }

    async fn rollback(&self, request: &RollbackRequest, _cancel: &CancelSignal) -> Result<(), AdapterError> {
        self.roll_back(request)
    }
}

/// provision -> build -> push -> deploy -> configure, each with a rollback
pub fn release_chain(policy: RetryPolicy) -> PipelineDefinition {
    PipelineDefinition::new(
        "release",
        vec![
            StageSpec::new("provision", AdapterKind::Provision)
                .with_action("infra/plan.tf")
                .with_retry(policy.clone())
                .with_rollback("destroy"),
            StageSpec::new("build", AdapterKind::Build)
                .depends_on(["provision"])
                .with_action("Dockerfile")
                .with_retry(policy.clone())
                .with_rollback("delete-image"),
            StageSpec::new("push", AdapterKind::Push)
                .depends_on(["build"])
                .with_retry(policy.clone())
                .with_rollback("untag"),
            StageSpec::new("deploy", AdapterKind::Deploy)
                .depends_on(["push"])
                .with_action("k8s/deployment.yaml")
                .with_retry(policy.clone())
                .with_rollback("undo-rollout"),
            StageSpec::new("configure", AdapterKind::Configure)
                .depends_on(["deploy"])
                .with_action("site.yml")
                .with_retry(policy)
                .with_rollback("revert-config"),
        ],
    )
    .unwrap()
}

pub fn engine(root: &Path, tools: &Arc<FakeTools>) -> (Engine, CollectingNotifier) {
    let notifier = CollectingNotifier::new();
    let engine = Engine::new(Arc::new(RunStore::new(root)), tools.adapter_set())
        .with_notifier(Arc::new(notifier.clone()));
    (engine, notifier)
}

/// Compact event names for order assertions
pub fn event_names(events: &[LifecycleEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| {
            let kind = serde_json::to_value(event).unwrap()["event"]
                .as_str()
                .unwrap()
                .to_string();
            match event.stage() {
                Some(stage) => format!("{}:{}", kind, stage),
                None => kind,
            }
        })
        .collect()
}
