//! Wire-format tests for payloads exchanged with agents and event consumers.

use chrono::Utc;
use strata_core::cmd::*;
use strata_core::events::*;
use strata_core::ids::*;
use strata_core::job::StepStatus;
use strata_core::node::NodePath;
use strata_core::variables::VariableMap;

fn shell_command() -> ShellCommand {
    let job_id = JobId::new();
    let path = NodePath::parse("root/build").unwrap();
    let mut environment = VariableMap::new();
    environment.insert("TARGET", "release");

    ShellCommand {
        id: CmdId::of(job_id, &path),
        job_id,
        path,
        scripts: vec!["cargo build".to_string()],
        environment,
        working_dir: "/var/strata/ws".to_string(),
        timeout_secs: 1800,
        env_filters: vec!["STRATA_".to_string()],
        plugin: None,
    }
}

#[test]
fn test_shell_command_is_tagged() {
    let cmd = Command::Shell(shell_command());

    let value: serde_json::Value = serde_json::to_value(&cmd).expect("serialize");
    assert_eq!(value["type"], "shell");
    assert_eq!(value["environment"]["TARGET"], "release");
    assert!(value.get("plugin").is_none());

    let parsed = Command::from_bytes(&cmd.to_bytes().unwrap()).expect("deserialize");
    assert_eq!(parsed, cmd);
}

#[test]
fn test_kill_command_is_tagged() {
    let job_id = JobId::new();
    let cmd = Command::kill(job_id, None);

    let value: serde_json::Value = serde_json::to_value(&cmd).expect("serialize");
    assert_eq!(value["type"], "kill");
    assert_eq!(cmd.job_id(), job_id);
    assert!(cmd.cmd_id().is_none());
}

#[test]
fn test_step_result_from_minimal_agent_message() {
    let job_id = JobId::new();
    let cmd_id = CmdId::of(job_id, &NodePath::parse("root/build").unwrap());
    let body = format!(
        r#"{{"cmd_id":"{}","status":"success","code":0,"output":{{"STRATA_VERSION":"1.2"}}}}"#,
        cmd_id
    );

    let result = StepResult::from_bytes(body.as_bytes()).expect("deserialize");
    assert_eq!(result.status, StepStatus::Success);
    assert_eq!(result.code, Some(0));
    assert_eq!(result.output.get("STRATA_VERSION"), Some("1.2"));
    assert!(result.error.is_none());
    assert_eq!(result.job_id().unwrap(), job_id);
}

#[test]
fn test_step_result_rejects_unknown_status() {
    let body = br#"{"cmd_id":"abc","status":"exploded"}"#;
    assert!(StepResult::from_bytes(body).is_err());
}

#[test]
fn test_step_event_tag() {
    let job_id = JobId::new();
    let path = NodePath::parse("root/build").unwrap();
    let event = Event::StepStatusChanged(StepStatusChangedPayload {
        job_id,
        cmd_id: CmdId::of(job_id, &path),
        path,
        from: StepStatus::Running,
        to: StepStatus::Failed,
        error: Some("exit 1".to_string()),
        timestamp: Utc::now(),
    });

    let value = serde_json::to_value(&event).expect("serialize");
    assert_eq!(value["type"], "step_status_changed");
    assert_eq!(value["to"], "failed");
    assert_eq!(value["path"], "root/build");

    let parsed: Event = serde_json::from_value(value).expect("deserialize");
    assert_eq!(parsed, event);
}
