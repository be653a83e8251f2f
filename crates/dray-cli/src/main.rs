//! Demo binary: wire a store, a registry, and the service together, push a
//! few jobs through the multi processor, and print what happened.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::info;

use dray_core::{
    JobService, JobStatus, ProcessorKind, ProcessorSettings, Store, Task, TaskContext, TaskError,
    TaskRegistry,
};

/// Returns its input untouched.
struct EchoTask;

#[async_trait]
impl Task for EchoTask {
    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Value, TaskError> {
        Ok(ctx.input().clone())
    }
}

/// Sleeps for `millis`, then logs its label.
struct SleepTask;

#[async_trait]
impl Task for SleepTask {
    async fn execute(&self, ctx: &mut TaskContext<'_>) -> Result<Value, TaskError> {
        let millis = ctx.input()["millis"].as_u64().unwrap_or(0);
        let label = ctx.input()["label"].as_i64().unwrap_or(-1);
        sleep(Duration::from_millis(millis)).await;
        info!("Job: {label}");
        Ok(json!({ "label": label }))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut registry = TaskRegistry::new();
    registry
        .register("echo", Arc::new(EchoTask))
        .expect("register echo");
    registry
        .register("sleep", Arc::new(SleepTask))
        .expect("register sleep");

    let service = JobService::new(Store::new(), Arc::new(registry));
    service
        .set_processor_settings(ProcessorSettings {
            kind: ProcessorKind::Multi,
            wait_time: Duration::from_millis(100),
            ..ProcessorSettings::default()
        })
        .await
        .expect("persist settings");

    let mut ids = Vec::new();
    for (millis, label) in [(400u64, 1i64), (1800, 2), (0, 3), (200, 4)] {
        let id = service
            .add("sleep", json!({ "millis": millis, "label": label }))
            .await
            .expect("enqueue job");
        info!(%id, label, "enqueued");
        ids.push(id);
    }
    ids.push(
        service
            .add("echo", json!({ "hello": "dray" }))
            .await
            .expect("enqueue job"),
    );

    service.start_processing().await.expect("start processing");

    loop {
        let counts = service.counts().await.expect("read counts");
        if counts.completed + counts.error == ids.len() {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    for id in &ids {
        let record = service.get(*id).await.expect("read job");
        let output = record.output.unwrap_or(Value::Null);
        info!(
            %id,
            status = ?record.status,
            output = %output,
            "finished"
        );
        assert_eq!(record.status, JobStatus::Completed);
    }
    info!(counts = ?service.counts().await.expect("read counts"), "all jobs finished");

    service.stop_processing().await.expect("stop processing");
}
