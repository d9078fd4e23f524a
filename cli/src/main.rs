use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::error;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
enum TriageClientError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned HTTP {status} for {path}")]
    Status { status: u16, path: String },
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("stdin read failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "medchain-cli", about = "MedChain triage and chat client")]
struct Cli {
    #[arg(long, env = "MEDCHAIN_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that the backend answers on `/`.
    Ping,
    /// Submit symptoms for triage.
    Triage {
        #[arg(required = true)]
        symptoms: Vec<String>,
    },
    /// Talk to the assistant line by line.
    Chat,
}

#[derive(Debug, Deserialize, PartialEq)]
struct TriageResult {
    urgency: String,
    advice: String,
    recommended_action: String,
    #[serde(default)]
    emergency: bool,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    text: String,
}

#[derive(Debug, Deserialize)]
struct ChatSession {
    id: Uuid,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct SendOutcome {
    assistant: ChatMessage,
}

struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Client {
    fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_owned(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn check(response: reqwest::Response, path: &str) -> Result<reqwest::Response, TriageClientError> {
        let status = response.status();
        if !status.is_success() {
            return Err(TriageClientError::Status { status: status.as_u16(), path: path.to_owned() });
        }
        Ok(response)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let cli = Cli::parse();
    let client = Client::new(&cli.base_url);

    // Failures are reported, never turned into a non-zero exit.
    let result = match cli.command {
        Command::Ping => run_ping(&client).await,
        Command::Triage { symptoms } => run_triage(&client, &symptoms.join(" ")).await,
        Command::Chat => run_chat(&client).await,
    };
    if let Err(e) = result {
        error!(error = %e, "request failed");
    }
}

async fn run_ping(client: &Client) -> Result<(), TriageClientError> {
    let response = client.http.get(client.url("/")).send().await?;
    let body: serde_json::Value = Client::check(response, "/")?.json().await?;
    println!("{}", body.get("message").and_then(serde_json::Value::as_str).unwrap_or("ok"));
    Ok(())
}

async fn run_triage(client: &Client, symptoms: &str) -> Result<(), TriageClientError> {
    let response = client
        .http
        .post(client.url("/triage"))
        .json(&json!({ "symptoms": symptoms }))
        .send()
        .await?;
    let result: TriageResult = Client::check(response, "/triage")?.json().await?;
    print!("{}", render_triage(&result));
    Ok(())
}

async fn run_chat(client: &Client) -> Result<(), TriageClientError> {
    let response = client.http.post(client.url("/api/chat/sessions")).send().await?;
    let session: ChatSession = Client::check(response, "/api/chat/sessions")?.json().await?;
    for message in &session.messages {
        println!("assistant> {}", message.text);
    }

    let repl = chat_loop(client, &format!("/api/chat/sessions/{}/messages", session.id)).await;

    // The session is discarded however the loop ended.
    let path = format!("/api/chat/sessions/{}", session.id);
    let discarded = match client.http.delete(client.url(&path)).send().await {
        Ok(response) => Client::check(response, &path).map(drop),
        Err(e) => Err(e.into()),
    };
    if let Err(e) = discarded {
        error!(session_id = %session.id, error = %e, "chat session discard failed");
    }
    repl
}

async fn chat_loop(client: &Client, path: &str) -> Result<(), TriageClientError> {
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(b"you> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        // A failed send is logged and the session stays usable.
        match send_line(client, path, &line).await {
            Ok(reply) => println!("assistant> {reply}"),
            Err(e) => error!(error = %e, "chat send failed"),
        }
    }
}

async fn send_line(client: &Client, path: &str, line: &str) -> Result<String, TriageClientError> {
    let response = client
        .http
        .post(client.url(path))
        .json(&json!({ "text": line }))
        .send()
        .await?;
    let body = Client::check(response, path)?.text().await?;
    parse_reply(&body)
}

fn parse_reply(body: &str) -> Result<String, TriageClientError> {
    let outcome: SendOutcome = serde_json::from_str(body)?;
    Ok(outcome.assistant.text)
}

fn render_triage(result: &TriageResult) -> String {
    let mut out = format!(
        "Urgency: {}\nAdvice: {}\nRecommended Action: {}\n",
        result.urgency, result.advice, result.recommended_action
    );
    if result.emergency {
        out.push_str("⚠ Emergency Situation\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_routine_result_without_banner() {
        let result: TriageResult = serde_json::from_value(json!({
            "urgency": "LOW",
            "advice": "Rest and stay hydrated.",
            "recommended_action": "Monitor symptoms at home",
            "facility_type": "self",
            "emergency": false
        }))
        .unwrap();
        let text = render_triage(&result);
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with("Urgency: LOW\n"));
        assert!(!text.contains("Emergency"));
    }

    #[test]
    fn renders_emergency_banner() {
        let result = TriageResult {
            urgency: "HIGH".into(),
            advice: "Seek emergency care immediately.".into(),
            recommended_action: "Go to the nearest emergency room".into(),
            emergency: true,
        };
        let text = render_triage(&result);
        assert!(text.ends_with("⚠ Emergency Situation\n"));
        assert!(text.contains("Recommended Action: Go to the nearest emergency room\n"));
    }

    #[test]
    fn missing_emergency_defaults_to_false() {
        let result: TriageResult = serde_json::from_value(json!({
            "urgency": "MEDIUM",
            "advice": "a",
            "recommended_action": "b"
        }))
        .unwrap();
        assert!(!result.emergency);
    }

    #[test]
    fn reply_text_is_taken_from_assistant_message() {
        let body = r#"{"user":{"id":"u-1","role":"user","text":"hi"},"assistant":{"id":"a-1","role":"assistant","text":"hello"}}"#;
        assert_eq!(parse_reply(body).unwrap(), "hello");
    }

    #[test]
    fn malformed_reply_is_an_error_not_a_panic() {
        for body in ["", "<html>oops</html>", r#"{"user":{}}"#] {
            assert!(matches!(parse_reply(body), Err(TriageClientError::Decode(_))), "body {body:?}");
        }
    }

    #[test]
    fn client_url_trims_trailing_slash() {
        let client = Client::new("http://localhost:3000/");
        assert_eq!(client.url("/triage"), "http://localhost:3000/triage");
    }

    #[test]
    fn triage_args_parse() {
        let cli = Cli::try_parse_from(["medchain-cli", "triage", "chest", "pain"]).unwrap();
        let Command::Triage { symptoms } = cli.command else {
            panic!("expected triage");
        };
        assert_eq!(symptoms.join(" "), "chest pain");
    }
}
