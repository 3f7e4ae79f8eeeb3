// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use revex::client::{Agent, AgentConfig};
use tokio_util::sync::CancellationToken;

pub async fn revproxy_main(config: AgentConfig, shutdown: CancellationToken) -> Result<()> {
  let namespace = config.namespace.clone();
  Agent::new(config)
    .run(shutdown)
    .await
    .with_context(|| format!("Revproxy for namespace {:?} failed", namespace))
}
