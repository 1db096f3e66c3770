//! Guest-agent wire messages (newline-delimited JSON)

use serde::{Deserialize, Serialize};

/// `{"execute": "...", "arguments": {...}}`
#[derive(Debug, Serialize)]
pub struct Command<'a, A: Serialize> {
    pub execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<A>,
}

#[derive(Debug, Serialize)]
pub struct ExecArgs<'a> {
    pub path: &'a str,
    pub arg: &'a [String],
    #[serde(rename = "capture-output")]
    pub capture_output: bool,
}

#[derive(Debug, Serialize)]
pub struct ExecStatusArgs {
    pub pid: i64,
}

/// Either `{"return": ...}` or `{"error": {...}}`
#[derive(Debug, Deserialize)]
pub struct Response<T> {
    #[serde(rename = "return")]
    pub ret: Option<T>,
    pub error: Option<AgentErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct AgentErrorBody {
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub desc: String,
}

/// `guest-ping` returns an empty object
#[derive(Debug, Deserialize)]
pub struct Empty {}

#[derive(Debug, Deserialize)]
pub struct ExecReturn {
    pub pid: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecStatus {
    #[serde(default)]
    pub exited: bool,
    pub exitcode: Option<i32>,
    pub signal: Option<i32>,
    #[serde(rename = "out-data")]
    pub out_data: Option<String>,
    #[serde(rename = "err-data")]
    pub err_data: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_command_shape() {
        let args = vec!["aux".to_string(), "--sort=-rss".to_string()];
        let cmd = Command {
            execute: "guest-exec",
            arguments: Some(ExecArgs {
                path: "/bin/ps",
                arg: &args,
                capture_output: true,
            }),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["execute"], "guest-exec");
        assert_eq!(json["arguments"]["path"], "/bin/ps");
        assert_eq!(json["arguments"]["arg"][1], "--sort=-rss");
        assert_eq!(json["arguments"]["capture-output"], true);
    }

    #[test]
    fn test_ping_has_no_arguments() {
        let cmd: Command<'_, ExecStatusArgs> = Command {
            execute: "guest-ping",
            arguments: None,
        };
        assert_eq!(serde_json::to_string(&cmd).unwrap(), r#"{"execute":"guest-ping"}"#);
    }

    #[test]
    fn test_status_response() {
        let text = r#"{"return": {"exitcode": 0, "out-data": "aGk=", "exited": true}}"#;
        let resp: Response<ExecStatus> = serde_json::from_str(text).unwrap();
        let status = resp.ret.unwrap();
        assert!(status.exited);
        assert_eq!(status.exitcode, Some(0));
        assert_eq!(status.out_data.as_deref(), Some("aGk="));
    }

    #[test]
    fn test_error_response() {
        let text = r#"{"error": {"class": "GenericError", "desc": "no such file"}}"#;
        let resp: Response<ExecReturn> = serde_json::from_str(text).unwrap();
        assert!(resp.ret.is_none());
        assert_eq!(resp.error.unwrap().desc, "no such file");
    }
}
