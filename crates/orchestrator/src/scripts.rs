//! Control script generation.
//!
//! Templates use a small mustache-like syntax: `{{Key}}` is replaced by the
//! value of `Key`, and `{{#Key}} .. {{/Key}}` repeats its body once per
//! element of the array `Key` (or once, when `Key` is `true`). Inside a
//! section the element's fields shadow the outer ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::fs;
use tracing::debug;

use crate::error::{OrchestratorError, Result};

/// Names of the scripts written at the top of a sandbox directory, paired
/// with the template each one is rendered from.
pub const AGGREGATE_SCRIPTS: &[(&str, &str)] = &[
    ("start_all", "start_multi_template"),
    ("restart_all", "restart_multi_template"),
    ("status_all", "status_multi_template"),
    ("test_sb_all", "test_sb_multi_template"),
    ("stop_all", "stop_multi_template"),
    ("clear_all", "clear_multi_template"),
    ("send_kill_all", "send_kill_multi_template"),
    ("use_all", "use_multi_template"),
];

pub const NODE_SHORTCUT_TEMPLATE: &str = "node_template";
pub const NODE_COMMAND_TEMPLATE: &str = "node_command_template";

#[async_trait]
pub trait ScriptWriter: Send + Sync {
    /// Render `template` with `data` into an executable file `dir/name`.
    async fn write_script(
        &self,
        dir: &Path,
        name: &str,
        template: &str,
        data: &Value,
    ) -> Result<PathBuf>;
}

const HEADER: &str = "#!/bin/sh\n# {{AppVersion}} generated on {{DateTime}}\n";

const NODE_TEMPLATE: &str = r##"SBDIR="{{SandboxDir}}"
exec "$SBDIR/{{NodeDir}}/use" "$@"
"##;

const NODE_COMMAND: &str = r##"# {{Script}} for {{NodeLabel}} (port {{NodePort}})
export SANDBOX_DIR="{{SandboxDir}}"
export NODE_DIR="{{NodeDirPath}}"
export NODE_PORT={{NodePort}}
export NODE_AUX_PORT="{{AuxPort}}"
export SERVER_ID={{ServerId}}
{{Command}}
"##;

const START_MULTI: &str = r##"SBDIR="{{SandboxDir}}"
{{#Nodes}}
echo "# executing 'start' on {{NodeDir}}"
"$SBDIR/{{NodeDir}}/start" "$@"
{{/Nodes}}
"##;

const RESTART_MULTI: &str = r##"SBDIR="{{SandboxDir}}"
"$SBDIR/stop_all"
"$SBDIR/start_all" "$@"
"##;

const STATUS_MULTI: &str = r##"SBDIR="{{SandboxDir}}"
echo "MULTIPLE $SBDIR"
{{#Nodes}}
"$SBDIR/{{NodeDir}}/status"
{{/Nodes}}
"##;

const TEST_SB_MULTI: &str = r##"SBDIR="{{SandboxDir}}"
rc=0
{{#Nodes}}
echo "# executing 'test_sb' on {{NodeDir}}"
"$SBDIR/{{NodeDir}}/test_sb" "$@" || rc=1
{{/Nodes}}
exit $rc
"##;

const STOP_MULTI: &str = r##"SBDIR="{{SandboxDir}}"
{{#Nodes}}
echo "# executing 'stop' on {{NodeDir}}"
"$SBDIR/{{NodeDir}}/stop" "$@"
{{/Nodes}}
"##;

const CLEAR_MULTI: &str = r##"SBDIR="{{SandboxDir}}"
{{#Nodes}}
echo "# executing 'clear' on {{NodeDir}}"
"$SBDIR/{{NodeDir}}/clear" "$@"
{{/Nodes}}
"##;

const SEND_KILL_MULTI: &str = r##"SBDIR="{{SandboxDir}}"
{{#Nodes}}
echo "# executing 'send_kill' on {{NodeDir}}"
"$SBDIR/{{NodeDir}}/send_kill" "$@"
{{/Nodes}}
"##;

const USE_MULTI: &str = r##"SBDIR="{{SandboxDir}}"
{{#Nodes}}
echo "# server: {{Node}}"
"$SBDIR/{{NodeDir}}/use" "$@"
{{/Nodes}}
"##;

/// Script writer backed by named in-memory templates.
#[derive(Debug, Clone)]
pub struct TemplateScriptWriter {
    templates: HashMap<String, String>,
}

impl Default for TemplateScriptWriter {
    fn default() -> Self {
        let builtin = [
            (NODE_SHORTCUT_TEMPLATE, NODE_TEMPLATE),
            (NODE_COMMAND_TEMPLATE, NODE_COMMAND),
            ("start_multi_template", START_MULTI),
            ("restart_multi_template", RESTART_MULTI),
            ("status_multi_template", STATUS_MULTI),
            ("test_sb_multi_template", TEST_SB_MULTI),
            ("stop_multi_template", STOP_MULTI),
            ("clear_multi_template", CLEAR_MULTI),
            ("send_kill_multi_template", SEND_KILL_MULTI),
            ("use_multi_template", USE_MULTI),
        ];
        Self {
            templates: builtin
                .into_iter()
                .map(|(name, body)| (name.to_string(), format!("{}{}", HEADER, body)))
                .collect(),
        }
    }
}

impl TemplateScriptWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a template.
    pub fn with_template(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.templates.insert(name.into(), text.into());
        self
    }

    pub fn render(&self, template: &str, data: &Value) -> Result<String> {
        let text = self
            .templates
            .get(template)
            .ok_or_else(|| OrchestratorError::Script(format!("unknown template '{}'", template)))?;
        render(text, data)
    }
}

#[async_trait]
impl ScriptWriter for TemplateScriptWriter {
    async fn write_script(
        &self,
        dir: &Path,
        name: &str,
        template: &str,
        data: &Value,
    ) -> Result<PathBuf> {
        let content = self.render(template, data)?;
        let path = dir.join(name);
        fs::write(&path, content).await?;
        make_executable(&path).await?;
        debug!(script = %path.display(), template, "Script written");
        Ok(path)
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Render `template` against `data`.
pub fn render(template: &str, data: &Value) -> Result<String> {
    render_scoped(template, &[data])
}

fn render_scoped(template: &str, scopes: &[&Value]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| OrchestratorError::Script("unclosed '{{' in template".to_string()))?;
        let tag = after[..close].trim();
        rest = &after[close + 2..];

        if let Some(section) = tag.strip_prefix('#') {
            let end_tag = format!("{{{{/{}}}}}", section);
            let end = rest.find(&end_tag).ok_or_else(|| {
                OrchestratorError::Script(format!("section '{}' is never closed", section))
            })?;
            let body = &rest[..end];
            let body = body.strip_prefix('\n').unwrap_or(body);
            rest = &rest[end + end_tag.len()..];
            rest = rest.strip_prefix('\n').unwrap_or(rest);

            match lookup(scopes, section) {
                Some(Value::Array(items)) => {
                    for item in items {
                        let mut inner = Vec::with_capacity(scopes.len() + 1);
                        inner.push(item);
                        inner.extend_from_slice(scopes);
                        out.push_str(&render_scoped(body, &inner)?);
                    }
                }
                Some(Value::Bool(true)) => out.push_str(&render_scoped(body, scopes)?),
                Some(Value::Bool(false)) | Some(Value::Null) | None => {}
                Some(_) => {
                    return Err(OrchestratorError::Script(format!(
                        "section '{}' is neither a list nor a flag",
                        section
                    )))
                }
            }
        } else if tag.starts_with('/') {
            return Err(OrchestratorError::Script(format!("unexpected '{}'", tag)));
        } else {
            let value = lookup(scopes, tag)
                .ok_or_else(|| OrchestratorError::Script(format!("no value for '{}'", tag)))?;
            out.push_str(&scalar(value));
        }
    }

    out.push_str(rest);
    Ok(out)
}

fn lookup<'a>(scopes: &[&'a Value], key: &str) -> Option<&'a Value> {
    scopes.iter().find_map(|scope| scope.get(key))
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_render_substitution() {
        let out = render("port={{Port}} dir={{ Dir }}", &json!({"Port": 20001, "Dir": "/sb"})).unwrap();
        assert_eq!(out, "port=20001 dir=/sb");
    }

    #[test]
    fn test_render_sections() {
        let data = json!({
            "SandboxDir": "/sb",
            "Nodes": [
                {"NodeDir": "node1"},
                {"NodeDir": "node2", "SandboxDir": "/other"},
            ],
        });
        let out = render("start\n{{#Nodes}}\n{{SandboxDir}}/{{NodeDir}}\n{{/Nodes}}\nend\n", &data).unwrap();
        assert_eq!(out, "start\n/sb/node1\n/other/node2\nend\n");
    }

    #[test]
    fn test_render_errors() {
        assert!(render("{{Missing}}", &json!({})).is_err());
        assert!(render("{{#Nodes}}never closed", &json!({"Nodes": []})).is_err());
        assert!(render("{{Open", &json!({})).is_err());
        assert!(render("{{#Port}}x{{/Port}}", &json!({"Port": 1})).is_err());
        assert_eq!(render("{{#Flag}}x{{/Flag}}", &json!({"Flag": false})).unwrap(), "");
    }

    #[test]
    fn test_builtin_aggregate_templates_render() {
        let writer = TemplateScriptWriter::new();
        let data = json!({
            "AppVersion": "dbsandbox 0.1.0",
            "DateTime": "today",
            "SandboxDir": "/sb/multi_msb_8_0_11",
            "Nodes": [
                {"Node": 1, "NodeDir": "node1"},
                {"Node": 2, "NodeDir": "node2"},
            ],
        });

        for (_, template) in AGGREGATE_SCRIPTS {
            let out = writer.render(template, &data).unwrap();
            assert!(out.starts_with("#!/bin/sh\n"), "{} has no shebang", template);
            assert!(out.contains("SBDIR=\"/sb/multi_msb_8_0_11\"\n"), "{}", template);
        }

        let start = writer.render("start_multi_template", &data).unwrap();
        assert!(start.contains("echo \"# executing 'start' on node1\""));
        assert!(start.contains("\"$SBDIR/node1/start\""));
        assert!(start.contains("\"$SBDIR/node2/start\""));

        let use_all = writer.render("use_multi_template", &data).unwrap();
        assert!(use_all.contains("echo \"# server: 2\""));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_node_command_script_handles_spaces_in_paths() {
        let temp_dir = TempDir::new().unwrap();
        let node_dir = temp_dir.path().join("my sandboxes").join("node1");
        tokio::fs::create_dir_all(&node_dir).await.unwrap();

        let data = json!({
            "AppVersion": "dbsandbox 0.1.0",
            "DateTime": "today",
            "Script": "status",
            "NodeLabel": "node1",
            "NodePort": 20001,
            "SandboxDir": temp_dir.path().join("my sandboxes").display().to_string(),
            "NodeDirPath": node_dir.display().to_string(),
            "AuxPort": "",
            "ServerId": 100,
            "Command": "printf '%s|%s' \"$NODE_DIR\" \"$NODE_PORT\"",
        });
        let path = TemplateScriptWriter::new()
            .write_script(&node_dir, "status", NODE_COMMAND_TEMPLATE, &data)
            .await
            .unwrap();

        let output = tokio::process::Command::new("sh")
            .arg(&path)
            .output()
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(
            String::from_utf8_lossy(&output.stdout),
            format!("{}|20001", node_dir.display())
        );
    }

    #[tokio::test]
    async fn test_write_script_is_executable() {
        let temp_dir = TempDir::new().unwrap();
        let writer = TemplateScriptWriter::new().with_template("hello", "echo {{Name}}\n");

        let path = writer
            .write_script(temp_dir.path(), "hello", "hello", &json!({"Name": "world"}))
            .await
            .unwrap();

        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "echo world\n");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn test_unknown_template() {
        let temp_dir = TempDir::new().unwrap();
        let err = TemplateScriptWriter::new()
            .write_script(temp_dir.path(), "x", "nope", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Script(_)));
    }
}
