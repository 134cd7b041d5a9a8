//! Eveus HTTP client
//!
//! The charger cannot handle concurrent sessions, so every exchange goes
//! through [`DeviceLink`], which owns the single conversation token.

use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use tracing::{debug, trace};

use crate::config::EveusConfig;
use crate::errors::EveusError;

const ENDPOINT_MAIN: &str = "main";
const ENDPOINT_EVENT: &str = "pageEvent";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Raw request/response access to the charger.
pub trait DeviceTransport: Send {
    /// Fetch the flat state object, returned as the unparsed body.
    fn fetch_state(&mut self) -> Result<String, EveusError>;

    /// Send one `pageEvent` command carrying a single value.
    fn send_command(&mut self, command: &str, value: &str) -> Result<(), EveusError>;

    /// Address used in log lines.
    fn host(&self) -> &str;
}

/// Blocking HTTP transport with basic auth over a kept-alive connection
pub struct HttpTransport {
    client: Client,
    host: String,
    username: String,
    password: String,
}

impl HttpTransport {
    pub fn new(config: &EveusConfig) -> Result<Self, EveusError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(config.request_timeout))
            .tcp_keepalive(KEEP_ALIVE)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| EveusError::ClientSetup(e.to_string()))?;

        Ok(Self {
            client,
            host: config.host.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("http://{}/{}", self.host, endpoint)
    }

    fn map_error(&self, err: reqwest::Error) -> EveusError {
        if err.is_timeout() {
            EveusError::Timeout {
                host: self.host.clone(),
            }
        } else if err.is_decode() || err.is_body() {
            EveusError::ParseError(err.to_string())
        } else {
            EveusError::ConnectionFailed {
                host: self.host.clone(),
                reason: err.to_string(),
            }
        }
    }

    fn check_status(&self, endpoint: &str, response: Response) -> Result<Response, EveusError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(EveusError::AuthFailed {
                host: self.host.clone(),
            });
        }
        if !status.is_success() {
            return Err(EveusError::HttpStatus {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

impl DeviceTransport for HttpTransport {
    fn fetch_state(&mut self) -> Result<String, EveusError> {
        let response = self
            .client
            .post(self.url(ENDPOINT_MAIN))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .map_err(|e| self.map_error(e))?;
        let response = self.check_status(ENDPOINT_MAIN, response)?;
        let body = response.text().map_err(|e| self.map_error(e))?;
        trace!("State response: {} bytes", body.len());
        Ok(body)
    }

    fn send_command(&mut self, command: &str, value: &str) -> Result<(), EveusError> {
        let response = self
            .client
            .post(self.url(ENDPOINT_EVENT))
            .basic_auth(&self.username, Some(&self.password))
            .form(&[("pageevent", command), (command, value)])
            .send()
            .map_err(|e| self.map_error(e))?;
        let response = self.check_status(ENDPOINT_EVENT, response)?;
        let body = response.text().map_err(|e| self.map_error(e))?;

        if body.to_lowercase().contains("error") {
            return Err(EveusError::CommandRejected {
                command: command.to_string(),
                reason: body.trim().to_string(),
            });
        }
        Ok(())
    }

    fn host(&self) -> &str {
        &self.host
    }
}

struct Conversation {
    transport: Box<dyn DeviceTransport>,
    last_command: Option<Instant>,
}

/// Serializes polls and commands against the charger.
pub struct DeviceLink {
    conversation: Mutex<Conversation>,
    command_spacing: Duration,
}

impl DeviceLink {
    pub fn new(transport: impl DeviceTransport + 'static, command_spacing: Duration) -> Self {
        Self {
            conversation: Mutex::new(Conversation {
                transport: Box::new(transport),
                last_command: None,
            }),
            command_spacing,
        }
    }

    pub fn fetch_state(&self) -> Result<String, EveusError> {
        let mut conversation = self.conversation.lock();
        conversation.transport.fetch_state()
    }

    /// Send a command, holding the token for the spacing wait as well so a
    /// poll cannot slip in between two commands.
    pub fn send_command(&self, command: &str, value: &str) -> Result<(), EveusError> {
        let mut conversation = self.conversation.lock();

        if let Some(last) = conversation.last_command {
            let since = last.elapsed();
            if since < self.command_spacing {
                thread::sleep(self.command_spacing - since);
            }
        }

        debug!(
            "Sending {}={} to {}",
            command,
            value,
            conversation.transport.host()
        );
        let result = conversation.transport.send_command(command, value);
        conversation.last_command = Some(Instant::now());
        result
    }
}
