//! Lifecycle actions on a running unit.
//!
//! Every action is a command executed inside the container; the command
//! set depends on the module type.

use anyhow::{Result, bail};
use async_trait::async_trait;
use armada_state::{BackupStrategy, ModuleType, UserSpec};

use crate::engine::Engine;

#[async_trait]
pub trait Operator: Send + Sync {
    async fn health_check(&self, engine: &dyn Engine, container: &str) -> Result<()>;

    async fn copy_config(
        &self,
        engine: &dyn Engine,
        container: &str,
        path: &str,
        content: &str,
    ) -> Result<()>;

    async fn start_service(&self, engine: &dyn Engine, container: &str) -> Result<()>;

    async fn stop_service(&self, engine: &dyn Engine, container: &str) -> Result<()>;

    async fn recover(&self, engine: &dyn Engine, container: &str) -> Result<()>;

    async fn backup(
        &self,
        engine: &dyn Engine,
        container: &str,
        strategy: &BackupStrategy,
    ) -> Result<()>;

    async fn create_users(&self, engine: &dyn Engine, container: &str, users: &[UserSpec]) -> Result<()>;

    /// Move the workload's data to `target`.
    async fn migrate(&self, engine: &dyn Engine, container: &str, target: &str) -> Result<()>;
}

/// Operator driving a workload through an in-container control script.
#[derive(Debug, Clone)]
pub struct ExecOperator {
    kind: ModuleType,
    script: &'static str,
}

pub fn new_operator(kind: ModuleType) -> ExecOperator {
    let script = match kind {
        ModuleType::Redis => "/opt/armada/redis-ctl",
        ModuleType::Mysql => "/opt/armada/mysql-ctl",
        ModuleType::Proxy => "/opt/armada/proxy-ctl",
        ModuleType::Generic => "/opt/armada/unit-ctl",
    };
    ExecOperator { kind, script }
}

impl ExecOperator {
    pub fn kind(&self) -> ModuleType {
        self.kind
    }

    async fn run(&self, engine: &dyn Engine, container: &str, args: &[&str]) -> Result<()> {
        let mut cmd = Vec::with_capacity(args.len() + 1);
        cmd.push(self.script.to_string());
        cmd.extend(args.iter().map(|a| a.to_string()));
        let output = engine.exec(container, &cmd).await?;
        if !output.success() {
            bail!(
                "{} {} exited with {}: {}",
                self.script,
                args.join(" "),
                output.exit_code,
                output.stdout.trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Operator for ExecOperator {
    async fn health_check(&self, engine: &dyn Engine, container: &str) -> Result<()> {
        self.run(engine, container, &["health"]).await
    }

    async fn copy_config(
        &self,
        engine: &dyn Engine,
        container: &str,
        path: &str,
        content: &str,
    ) -> Result<()> {
        engine
            .copy_to_container(container, path, content.as_bytes())
            .await
    }

    async fn start_service(&self, engine: &dyn Engine, container: &str) -> Result<()> {
        self.run(engine, container, &["start"]).await
    }

    async fn stop_service(&self, engine: &dyn Engine, container: &str) -> Result<()> {
        self.run(engine, container, &["stop"]).await
    }

    async fn recover(&self, engine: &dyn Engine, container: &str) -> Result<()> {
        self.run(engine, container, &["recover"]).await
    }

    async fn backup(
        &self,
        engine: &dyn Engine,
        container: &str,
        strategy: &BackupStrategy,
    ) -> Result<()> {
        let retention = strategy.retention_days.to_string();
        self.run(
            engine,
            container,
            &["backup", &strategy.target, "--retention-days", &retention],
        )
        .await
    }

    async fn create_users(&self, engine: &dyn Engine, container: &str, users: &[UserSpec]) -> Result<()> {
        // Generic and proxy workloads have no user store.
        if matches!(self.kind, ModuleType::Generic | ModuleType::Proxy) {
            return Ok(());
        }
        for user in users {
            self.run(
                engine,
                container,
                &["create-user", &user.name, &user.password, &user.role],
            )
            .await?;
        }
        Ok(())
    }

    async fn migrate(&self, engine: &dyn Engine, container: &str, target: &str) -> Result<()> {
        self.run(engine, container, &["migrate", target]).await
    }
}
