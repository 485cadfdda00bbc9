use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use crate::cleanup::{CleanupAction, CleanupStack};
use crate::error::{OrchestratorError, Result};
use crate::provisioner::{NodeInstaller, NodeSetup};
use crate::scheduler::ExecutionStep;
use crate::scripts::{ScriptWriter, NODE_COMMAND_TEMPLATE};

pub const NODE_CONFIG_FILE: &str = "node.json";

pub const INIT_TIER: u32 = 0;
pub const START_TIER: u32 = 1;

/// Shell commands that make up a node's lifecycle.
///
/// Every command runs through `sh -c` inside the node directory with
/// `BASEDIR`, `SANDBOX_DIR`, `NODE_DIR`, `NODE_PORT`, `NODE_AUX_PORT` and
/// `SERVER_ID` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeCommands {
    /// Run once before the node is first started. Empty means none.
    pub init: String,
    pub start: String,
    pub stop: String,
    pub status: String,
    /// Opens a client session; receives the script's arguments.
    pub client: String,
    pub clear: String,
    pub send_kill: String,
    pub test: String,
}

impl Default for NodeCommands {
    fn default() -> Self {
        let socket = "/tmp/mysql_sandbox$NODE_PORT.sock";
        Self {
            init: "\"$BASEDIR/bin/mysqld\" --no-defaults --initialize-insecure \
                   --basedir=\"$BASEDIR\" --datadir=\"$NODE_DIR/data\""
                .to_string(),
            start: format!(
                "\"$BASEDIR/bin/mysqld_safe\" --no-defaults --basedir=\"$BASEDIR\" \
                 --datadir=\"$NODE_DIR/data\" --port=$NODE_PORT --server-id=$SERVER_ID \
                 --socket={socket} --pid-file=\"$NODE_DIR/data/mysqld.pid\" > /dev/null 2>&1 &"
            ),
            stop: format!("\"$BASEDIR/bin/mysqladmin\" --socket={socket} -u root shutdown"),
            status: format!(
                "\"$BASEDIR/bin/mysqladmin\" --socket={socket} -u root ping > /dev/null 2>&1 \
                 && echo \"$NODE_DIR on\" || echo \"$NODE_DIR off\""
            ),
            client: format!("\"$BASEDIR/bin/mysql\" --socket={socket} -u root \"$@\""),
            clear: "rm -rf \"$NODE_DIR/data\"".to_string(),
            send_kill: "kill -9 $(cat \"$NODE_DIR/data/mysqld.pid\")".to_string(),
            test: format!(
                "\"$BASEDIR/bin/mysql\" --socket={socket} -u root -e 'SELECT @@server_id, @@port'"
            ),
        }
    }
}

impl NodeCommands {
    /// Control scripts written into every node directory.
    fn scripts(&self) -> [(&'static str, String); 9] {
        [
            ("start", self.start.clone()),
            ("stop", self.stop.clone()),
            ("restart", "\"$NODE_DIR/stop\"\n\"$NODE_DIR/start\"".to_string()),
            ("status", self.status.clone()),
            ("use", self.client.clone()),
            ("clear", self.clear.clone()),
            ("send_kill", self.send_kill.clone()),
            ("test_sb", self.test.clone()),
            ("init", self.init.clone()),
        ]
    }
}

/// What `node.json` holds.
#[derive(Debug, Serialize)]
struct NodeConfigFile<'a> {
    #[serde(rename = "type")]
    sandbox_type: String,
    version: String,
    basedir: &'a Path,
    sandbox_dir: &'a Path,
    #[serde(flatten)]
    node: &'a sandbox_core::NodeDescriptor,
}

/// Installs a node by running configured shell commands.
pub struct CommandNodeInstaller {
    commands: NodeCommands,
    scripts: Arc<dyn ScriptWriter>,
    app_version: String,
}

impl CommandNodeInstaller {
    pub fn new(commands: NodeCommands, scripts: Arc<dyn ScriptWriter>) -> Self {
        Self {
            commands,
            scripts,
            app_version: concat!("dbsandbox ", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }

    async fn write_node_config(&self, setup: &NodeSetup) -> Result<()> {
        let config = NodeConfigFile {
            sandbox_type: format!("{}-node", setup.sandbox_type),
            version: setup.version.to_string(),
            basedir: &setup.basedir,
            sandbox_dir: &setup.sandbox_dir,
            node: &setup.node,
        };
        let content = serde_json::to_string_pretty(&config)?;
        tokio::fs::write(setup.node_dir.join(NODE_CONFIG_FILE), content).await?;
        Ok(())
    }

    async fn write_node_scripts(&self, setup: &NodeSetup) -> Result<()> {
        let node = &setup.node;
        let date_time = Utc::now().to_rfc2822();
        for (name, command) in self.commands.scripts() {
            let data = json!({
                "AppVersion": self.app_version,
                "DateTime": date_time,
                "Script": name,
                "NodeLabel": node.label,
                "NodePort": node.port,
                "SandboxDir": setup.sandbox_dir.display().to_string(),
                "NodeDirPath": setup.node_dir.display().to_string(),
                "AuxPort": aux_port(node),
                "ServerId": node.server_id,
                "Command": command,
            });
            self.scripts
                .write_script(&setup.node_dir, name, NODE_COMMAND_TEMPLATE, &data)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl NodeInstaller for CommandNodeInstaller {
    async fn install(&self, setup: &NodeSetup, cleanup: &CleanupStack) -> Result<Vec<ExecutionStep>> {
        self.write_node_config(setup).await?;
        self.write_node_scripts(setup).await?;

        let env = NodeEnv::from_setup(setup);
        let mut steps = Vec::with_capacity(2);

        if !self.commands.init.trim().is_empty() {
            let command = self.commands.init.clone();
            let env = env.clone();
            steps.push(ExecutionStep::new(
                Arc::clone(&setup.node),
                INIT_TIER,
                "initialize",
                move || async move { run_shell("initialize", &command, &env).await },
            ));
        }

        let start = self.commands.start.clone();
        let stop = self.commands.stop.clone();
        let cleanup = cleanup.clone();
        steps.push(ExecutionStep::new(
            Arc::clone(&setup.node),
            START_TIER,
            "start",
            move || async move {
                run_shell("start", &start, &env).await?;
                let target = env.node_dir.clone();
                cleanup.register(CleanupAction::new("stop", target, move || async move {
                    run_shell("stop", &stop, &env).await
                }));
                Ok(())
            },
        ));

        Ok(steps)
    }
}

fn aux_port(node: &sandbox_core::NodeDescriptor) -> String {
    match (node.auxiliary_enabled, node.auxiliary_port) {
        (true, Some(port)) => port.to_string(),
        _ => String::new(),
    }
}

/// Environment handed to node commands.
#[derive(Debug, Clone)]
struct NodeEnv {
    basedir: String,
    sandbox_dir: String,
    node_dir: String,
    port: String,
    aux_port: String,
    server_id: String,
}

impl NodeEnv {
    fn from_setup(setup: &NodeSetup) -> Self {
        Self {
            basedir: setup.basedir.display().to_string(),
            sandbox_dir: setup.sandbox_dir.display().to_string(),
            node_dir: setup.node_dir.display().to_string(),
            port: setup.node.port.to_string(),
            aux_port: aux_port(&setup.node),
            server_id: setup.node.server_id.to_string(),
        }
    }

    fn vars(&self) -> [(&'static str, &str); 6] {
        [
            ("BASEDIR", self.basedir.as_str()),
            ("SANDBOX_DIR", self.sandbox_dir.as_str()),
            ("NODE_DIR", self.node_dir.as_str()),
            ("NODE_PORT", self.port.as_str()),
            ("NODE_AUX_PORT", self.aux_port.as_str()),
            ("SERVER_ID", self.server_id.as_str()),
        ]
    }
}

async fn run_shell(label: &str, command: &str, env: &NodeEnv) -> Result<()> {
    debug!(step = label, node_dir = %env.node_dir, "Running {:?}", command);

    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .envs(env.vars())
        .current_dir(&env.node_dir)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| OrchestratorError::command_failed(label, e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OrchestratorError::command_failed(
            label,
            format!("{}: {}", output.status, stderr.trim()),
        ));
    }

    Ok(())
}

/// Run a shell script, failing on a non-zero exit.
pub async fn run_script(path: &Path) -> Result<()> {
    let label = path.display().to_string();
    debug!(script = %label, "Running script");

    let output = Command::new("sh")
        .arg(path)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| OrchestratorError::command_failed(&label, e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(OrchestratorError::command_failed(
            label,
            format!("{}: {}", output.status, stderr.trim()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ExecutionBatch;
    use crate::scheduler::ExecutionScheduler;
    use crate::scripts::TemplateScriptWriter;
    use sandbox_core::{ConcurrencyMode, NodeDescriptor, Version};
    use tempfile::TempDir;

    fn setup(root: &Path, commands_aux: bool) -> NodeSetup {
        let sandbox_dir = root.join("multi_msb_8_0_11");
        let node_dir = sandbox_dir.join("node1");
        std::fs::create_dir_all(&node_dir).unwrap();
        NodeSetup {
            node: Arc::new(NodeDescriptor {
                ordinal: 1,
                port: 25112,
                auxiliary_port: commands_aux.then_some(35112),
                auxiliary_enabled: commands_aux,
                server_id: 100,
                dir_name: "node1".to_string(),
                label: "node1".to_string(),
            }),
            version: Version::new(8, 0, 11),
            basedir: root.join("basedir"),
            sandbox_dir,
            node_dir,
            sandbox_type: "multiple".to_string(),
        }
    }

    fn commands() -> NodeCommands {
        NodeCommands {
            init: "echo \"$NODE_PORT $SERVER_ID $NODE_AUX_PORT\" > init.out".to_string(),
            start: "touch started".to_string(),
            stop: "rm started".to_string(),
            ..NodeCommands::default()
        }
    }

    fn installer(commands: NodeCommands) -> CommandNodeInstaller {
        CommandNodeInstaller::new(commands, Arc::new(TemplateScriptWriter::new()))
    }

    #[tokio::test]
    async fn test_install_writes_files_and_returns_steps() {
        let temp_dir = TempDir::new().unwrap();
        let setup = setup(temp_dir.path(), false);
        let cleanup = CleanupStack::new();

        let steps = installer(commands()).install(&setup, &cleanup).await.unwrap();

        let labels: Vec<(&str, u32)> = steps.iter().map(|s| (s.label(), s.tier())).collect();
        assert_eq!(labels, vec![("initialize", 0), ("start", 1)]);

        let config: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(setup.node_dir.join(NODE_CONFIG_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(config["type"], "multiple-node");
        assert_eq!(config["port"], 25112);
        assert_eq!(config["server_id"], 100);

        for script in ["start", "stop", "status", "use", "clear", "send_kill", "test_sb"] {
            assert!(setup.node_dir.join(script).is_file(), "missing {}", script);
        }
        // Nothing runs during install.
        assert!(!setup.node_dir.join("init.out").exists());
        assert!(cleanup.is_empty());
    }

    #[tokio::test]
    async fn test_steps_run_commands_with_node_env() {
        let temp_dir = TempDir::new().unwrap();
        let setup = setup(temp_dir.path(), true);
        let cleanup = CleanupStack::new();

        let steps = installer(commands()).install(&setup, &cleanup).await.unwrap();
        let mut batch = ExecutionBatch::new();
        batch.extend(steps);
        ExecutionScheduler::new(ConcurrencyMode::Sequential)
            .run(batch)
            .await
            .unwrap();

        let out = std::fs::read_to_string(setup.node_dir.join("init.out")).unwrap();
        assert_eq!(out.trim(), "25112 100 35112");
        assert!(setup.node_dir.join("started").exists());

        // A started node is stopped again on unwind.
        assert_eq!(cleanup.names(), vec!["stop"]);
        let report = cleanup.unwind().await;
        assert!(report.is_clean());
        assert!(!setup.node_dir.join("started").exists());
    }

    #[tokio::test]
    async fn test_failing_command_fails_step() {
        let temp_dir = TempDir::new().unwrap();
        let setup = setup(temp_dir.path(), false);
        let cleanup = CleanupStack::new();
        let commands = NodeCommands {
            init: String::new(),
            start: "echo boom >&2; exit 3".to_string(),
            ..commands()
        };

        let steps = installer(commands).install(&setup, &cleanup).await.unwrap();
        assert_eq!(steps.len(), 1);

        let mut batch = ExecutionBatch::new();
        batch.extend(steps);
        let err = ExecutionScheduler::new(ConcurrencyMode::Sequential)
            .run(batch)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("boom"));
        assert!(cleanup.is_empty());
    }

    #[tokio::test]
    async fn test_run_script() {
        let temp_dir = TempDir::new().unwrap();
        let writer = TemplateScriptWriter::new()
            .with_template("ok", "#!/bin/sh\nexit 0\n")
            .with_template("fail", "#!/bin/sh\nexit 1\n");
        let ok = writer
            .write_script(temp_dir.path(), "ok", "ok", &json!({}))
            .await
            .unwrap();
        let fail = writer
            .write_script(temp_dir.path(), "fail", "fail", &json!({}))
            .await
            .unwrap();

        assert!(run_script(&ok).await.is_ok());
        assert!(run_script(&fail).await.is_err());
    }
}
