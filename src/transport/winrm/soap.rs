//! WS-Management SOAP client for the Windows `cmd` shell.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, StatusCode};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::shell::{RemoteShell, ShellOutput};
use crate::transport::{ConnectionErrorKind, TransportError, TransportFuture};

const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
const CMD_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

/// Fault code WinRM returns when a Receive outlives the operation timeout
/// while the command is still running.
const RECEIVE_TIMED_OUT: &str = "2150858793";

const MAX_ENVELOPE_SIZE: u32 = 153_600;

/// Endpoint and credentials for [`SoapShell`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SoapEndpoint {
    /// Full `http(s)://host:port/wsman` URL.
    pub url: String,
    /// Basic authentication user.
    pub username: String,
    /// Basic authentication password.
    pub password: String,
    /// WS-Management operation timeout.
    pub operation_timeout: Duration,
}

/// Remote shell speaking WS-Management SOAP over HTTP with Basic
/// authentication.
#[derive(Clone, Debug)]
pub struct SoapShell {
    client: Client,
    endpoint: SoapEndpoint,
}

impl SoapShell {
    /// Builds a client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Config`] when the HTTP client cannot be
    /// constructed.
    pub fn new(endpoint: SoapEndpoint) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(endpoint.operation_timeout + Duration::from_secs(10))
            .build()
            .map_err(|err| TransportError::Config {
                message: format!("failed to build WinRM HTTP client: {err}"),
            })?;
        Ok(Self { client, endpoint })
    }

    fn envelope(&self, action: &str, shell_id: Option<&str>, options: &str, body: &str) -> String {
        let selector = shell_id.map_or_else(String::new, |id| {
            format!(
                "<w:SelectorSet><w:Selector Name=\"ShellId\">{}</w:Selector></w:SelectorSet>",
                xml_escape(id)
            )
        });
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  <s:Header>
    <a:To>{url}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{CMD_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo><a:Address s:mustUnderstand="true">{ANONYMOUS}</a:Address></a:ReplyTo>
    <a:Action s:mustUnderstand="true">{action}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>PT{timeout}S</w:OperationTimeout>
    {selector}{options}
  </s:Header>
  <s:Body>{body}</s:Body>
</s:Envelope>"#,
            url = xml_escape(&self.endpoint.url),
            message_id = Uuid::new_v4(),
            timeout = self.endpoint.operation_timeout.as_secs(),
        )
    }

    async fn send(&self, envelope: String) -> Result<(StatusCode, String), TransportError> {
        trace!(url = %self.endpoint.url, "sending WinRM request");
        let response = self
            .client
            .post(&self.endpoint.url)
            .basic_auth(&self.endpoint.username, Some(&self.endpoint.password))
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(envelope)
            .send()
            .await
            .map_err(|err| self.http_error(&err))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Connection {
                kind: ConnectionErrorKind::AuthFailure,
                endpoint: self.endpoint.url.clone(),
                message: "WinRM endpoint rejected the credentials".to_owned(),
            });
        }
        let body = response
            .text()
            .await
            .map_err(|err| self.http_error(&err))?;
        Ok((status, body))
    }

    async fn send_ok(&self, envelope: String, what: &str) -> Result<String, TransportError> {
        let (status, body) = self.send(envelope).await?;
        if status.is_success() {
            return Ok(body);
        }
        Err(self.protocol_error(format!("{what} failed with HTTP {status}: {}", fault_text(&body))))
    }

    fn http_error(&self, err: &reqwest::Error) -> TransportError {
        let message = err.to_string();
        let kind = if err.is_timeout() {
            Some(ConnectionErrorKind::Timeout)
        } else if err.is_connect() {
            Some(ConnectionErrorKind::classify(&message).unwrap_or(ConnectionErrorKind::Refused))
        } else {
            ConnectionErrorKind::classify(&message)
        };
        kind.map_or_else(
            || self.protocol_error(message.clone()),
            |kind| TransportError::Connection {
                kind,
                endpoint: self.endpoint.url.clone(),
                message: message.clone(),
            },
        )
    }

    fn protocol_error(&self, message: String) -> TransportError {
        TransportError::Protocol {
            endpoint: self.endpoint.url.clone(),
            message,
        }
    }

    async fn receive(&self, shell_id: &str, command_id: &str) -> Result<ShellOutput, TransportError> {
        let mut output = ShellOutput::default();
        loop {
            let body = format!(
                "<rsp:Receive><rsp:DesiredStream CommandId=\"{}\">stdout stderr</rsp:DesiredStream></rsp:Receive>",
                xml_escape(command_id)
            );
            let envelope = self.envelope(ACTION_RECEIVE, Some(shell_id), "", &body);
            let (status, response) = self.send(envelope).await?;
            if !status.is_success() {
                if response.contains(RECEIVE_TIMED_OUT) {
                    trace!(command_id, "receive timed out, polling again");
                    continue;
                }
                return Err(self.protocol_error(format!(
                    "receive failed with HTTP {status}: {}",
                    fault_text(&response)
                )));
            }

            let chunk = parse_receive(&response).map_err(|message| {
                self.protocol_error(format!("malformed receive response: {message}"))
            })?;
            output.stdout.push_str(&chunk.stdout);
            output.stderr.push_str(&chunk.stderr);
            if let Some(code) = chunk.exit_code {
                output.exit_code = code;
            }
            if chunk.done {
                return Ok(output);
            }
        }
    }

    async fn signal_terminate(&self, shell_id: &str, command_id: &str) {
        let body = format!(
            "<rsp:Signal CommandId=\"{}\"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>",
            xml_escape(command_id)
        );
        let envelope = self.envelope(ACTION_SIGNAL, Some(shell_id), "", &body);
        match self.send(envelope).await {
            Ok((status, _)) if status.is_success() => {}
            Ok((status, _)) => warn!(shell_id, command_id, %status, "failed to signal command termination"),
            Err(err) => warn!(shell_id, command_id, error = %err, "failed to signal command termination"),
        }
    }
}

impl RemoteShell for SoapShell {
    fn open(&self) -> TransportFuture<'_, String> {
        Box::pin(async move {
            let options = "<w:OptionSet>\
<w:Option Name=\"WINRS_NOPROFILE\">FALSE</w:Option>\
<w:Option Name=\"WINRS_CODEPAGE\">65001</w:Option>\
</w:OptionSet>";
            let body = "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams>\
<rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>";
            let envelope = self.envelope(ACTION_CREATE, None, options, body);
            let response = self.send_ok(envelope, "create shell").await?;
            let shell_id = extract_element(&response, "rsp:ShellId")
                .or_else(|| extract_selector(&response, "ShellId"))
                .ok_or_else(|| self.protocol_error("response carried no shell id".to_owned()))?;
            debug!(shell_id = %shell_id, "opened WinRM shell");
            Ok(shell_id)
        })
    }

    fn run<'a>(
        &'a self,
        shell_id: &'a str,
        command: &'a str,
        args: &'a [String],
    ) -> TransportFuture<'a, ShellOutput> {
        Box::pin(async move {
            let arguments: String = args
                .iter()
                .map(|arg| format!("<rsp:Arguments>{}</rsp:Arguments>", xml_escape(arg)))
                .collect();
            let body = format!(
                "<rsp:CommandLine><rsp:Command>{}</rsp:Command>{arguments}</rsp:CommandLine>",
                xml_escape(command)
            );
            let options = "<w:OptionSet>\
<w:Option Name=\"WINRS_CONSOLEMODE_STDIN\">TRUE</w:Option>\
<w:Option Name=\"WINRS_SKIP_CMD_SHELL\">FALSE</w:Option>\
</w:OptionSet>";
            let envelope = self.envelope(ACTION_COMMAND, Some(shell_id), options, &body);
            let response = self.send_ok(envelope, "command").await?;
            let command_id = extract_element(&response, "rsp:CommandId")
                .ok_or_else(|| self.protocol_error("response carried no command id".to_owned()))?;

            let output = self.receive(shell_id, &command_id).await;
            self.signal_terminate(shell_id, &command_id).await;
            output
        })
    }

    fn close<'a>(&'a self, shell_id: &'a str) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let envelope = self.envelope(ACTION_DELETE, Some(shell_id), "", "");
            self.send_ok(envelope, "delete shell").await?;
            debug!(shell_id, "closed WinRM shell");
            Ok(())
        })
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
struct ReceiveChunk {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
    done: bool,
}

fn parse_receive(response: &str) -> Result<ReceiveChunk, String> {
    let mut chunk = ReceiveChunk {
        done: response.contains("CommandState/Done") || response.contains("State=\"Done\""),
        ..ReceiveChunk::default()
    };

    let mut rest = response;
    while let Some((_, tag)) = rest.split_once("<rsp:Stream ") {
        let (header, after) = tag
            .split_once('>')
            .ok_or_else(|| "unterminated rsp:Stream tag".to_owned())?;
        if header.ends_with('/') {
            rest = after;
            continue;
        }
        let (content, after) = after
            .split_once("</rsp:Stream>")
            .ok_or_else(|| "rsp:Stream element is never closed".to_owned())?;
        let decoded = STANDARD
            .decode(content.trim())
            .map_err(|err| format!("rsp:Stream is not base64: {err}"))?;
        let text = String::from_utf8_lossy(&decoded);
        if header.contains("Name=\"stderr\"") {
            chunk.stderr.push_str(&text);
        } else {
            chunk.stdout.push_str(&text);
        }
        rest = after;
    }

    chunk.exit_code = extract_element(response, "rsp:ExitCode").and_then(|code| code.parse().ok());
    Ok(chunk)
}

fn extract_element(xml: &str, tag: &str) -> Option<String> {
    let (_, rest) = xml.split_once(&format!("<{tag}>"))?;
    let (value, _) = rest.split_once(&format!("</{tag}>"))?;
    Some(value.trim().to_owned())
}

fn extract_selector(xml: &str, name: &str) -> Option<String> {
    let (_, rest) = xml.split_once(&format!("Name=\"{name}\">"))?;
    let (value, _) = rest.split_once("</")?;
    Some(value.trim().to_owned())
}

fn fault_text(body: &str) -> String {
    extract_element(body, "s:Text")
        .or_else(|| extract_element(body, "f:Message"))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
