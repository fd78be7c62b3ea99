//! The socket request/response schema (§6): one JSON object in, one out,
//! then the connection closes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{ command: string, args?: string[] }`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The seven recognized commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Diagnostics,
    Hover,
    Start,
    Logs,
    Pwd,
    Stop,
}

impl Command {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "status" => Some(Command::Status),
            "diagnostics" => Some(Command::Diagnostics),
            "hover" => Some(Command::Hover),
            "start" => Some(Command::Start),
            "logs" => Some(Command::Logs),
            "pwd" => Some(Command::Pwd),
            "stop" => Some(Command::Stop),
            _ => None,
        }
    }

    /// Validate the argument arity this command expects.
    pub fn validate_args(&self, args: &[String]) -> Result<(), String> {
        let arity_ok = match self {
            Command::Diagnostics => args.len() == 1,
            Command::Hover => args.len() == 2,
            Command::Start => args.len() <= 1,
            Command::Status | Command::Logs | Command::Pwd | Command::Stop => args.is_empty(),
        };
        if arity_ok {
            Ok(())
        } else {
            Err(format!("wrong argument count for command '{self:?}'"))
        }
    }
}

/// Build the `{success:true,...}` response envelope.
pub fn success(result: Value) -> Value {
    serde_json::json!({
        "success": true,
        "result": result,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

/// Build the `{success:false,...}` response envelope.
pub fn failure(error: impl std::fmt::Display) -> Value {
    serde_json::json!({
        "success": false,
        "error": error.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_seven_commands() {
        for name in ["status", "diagnostics", "hover", "start", "logs", "pwd", "stop"] {
            assert!(Command::parse(name).is_some(), "{name} should parse");
        }
        assert!(Command::parse("rename").is_none());
    }

    #[test]
    fn diagnostics_requires_exactly_one_arg() {
        let cmd = Command::Diagnostics;
        assert!(cmd.validate_args(&["a.ts".to_string()]).is_ok());
        assert!(cmd.validate_args(&[]).is_err());
        assert!(cmd
            .validate_args(&["a.ts".to_string(), "b.ts".to_string()])
            .is_err());
    }

    #[test]
    fn hover_requires_exactly_two_args() {
        let cmd = Command::Hover;
        assert!(cmd
            .validate_args(&["a.ts".to_string(), "greet".to_string()])
            .is_ok());
        assert!(cmd.validate_args(&["a.ts".to_string()]).is_err());
    }

    #[test]
    fn start_allows_zero_or_one_args() {
        let cmd = Command::Start;
        assert!(cmd.validate_args(&[]).is_ok());
        assert!(cmd.validate_args(&["/tmp".to_string()]).is_ok());
        assert!(cmd
            .validate_args(&["/tmp".to_string(), "extra".to_string()])
            .is_err());
    }
}
