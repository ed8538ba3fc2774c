//! Proxmox VE REST client

use super::HypervisorApi;
use crate::error::{Result, ScalerError};
use crate::models::{ExecStatus, VmConfigUpdate, VmPowerState, VmSummary};
use crate::retry::poll_until;
use crate::settings::{PollSettings, ProxmoxSettings};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use url::Url;

/// How long clone and delete tasks are waited for
const TASK_POLL: PollSettings = PollSettings::new(2, 300);

/// Where and as whom to log in
#[derive(Debug, Clone)]
pub struct ProxmoxCredentials {
    /// Base of the JSON API, ending in `/api2/json/`
    pub base_url: Url,
    pub user: String,
    pub password: String,
    pub verify_ssl: bool,
}

impl ProxmoxCredentials {
    pub fn from_settings(settings: &ProxmoxSettings) -> Result<Self> {
        let raw = format!("https://{}:{}/api2/json/", settings.host, settings.port);
        let base_url = Url::parse(&raw)
            .map_err(|e| ScalerError::Config(format!("invalid proxmox address {raw}: {e}")))?;
        Ok(Self {
            base_url,
            user: settings.user.clone(),
            password: settings.password.clone(),
            verify_ssl: settings.verify_ssl,
        })
    }
}

#[derive(Debug, Clone)]
struct Ticket {
    cookie: String,
    csrf_token: String,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TicketResponse {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(Deserialize)]
struct HostEntry {
    node: String,
}

#[derive(Deserialize)]
struct CurrentStatus {
    status: VmPowerState,
}

#[derive(Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

#[derive(Deserialize)]
struct ExecStarted {
    pid: u64,
}

#[derive(Deserialize)]
struct RawExecStatus {
    #[serde(default)]
    exited: Value,
    #[serde(default)]
    exitcode: Option<i64>,
    #[serde(default, rename = "out-data")]
    out_data: String,
    #[serde(default, rename = "err-data")]
    err_data: String,
}

impl From<RawExecStatus> for ExecStatus {
    fn from(raw: RawExecStatus) -> Self {
        // older agents report 0/1, newer ones a boolean
        let exited = raw.exited.as_bool().unwrap_or(false) || raw.exited.as_i64() == Some(1);
        ExecStatus {
            exited,
            exit_code: raw.exitcode,
            out_data: raw.out_data,
            err_data: raw.err_data,
        }
    }
}

#[derive(Deserialize)]
struct AgentInterfaces {
    #[serde(default)]
    result: Vec<AgentInterface>,
}

#[derive(Deserialize)]
struct AgentInterface {
    #[serde(default, rename = "ip-addresses")]
    ip_addresses: Vec<AgentAddress>,
}

#[derive(Deserialize)]
struct AgentAddress {
    #[serde(rename = "ip-address")]
    ip_address: String,
    #[serde(rename = "ip-address-type")]
    ip_address_type: String,
}

/// `HypervisorApi` over the Proxmox VE JSON API
pub struct ProxmoxClient {
    client: Client,
    credentials: ProxmoxCredentials,
    ticket: RwLock<Option<Ticket>>,
    task_poll: PollSettings,
}

impl ProxmoxClient {
    pub fn new(credentials: ProxmoxCredentials) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!credentials.verify_ssl)
            .build()?;

        Ok(Self {
            client,
            credentials,
            ticket: RwLock::new(None),
            task_poll: TASK_POLL,
        })
    }

    pub fn with_task_poll(mut self, task_poll: PollSettings) -> Self {
        self.task_poll = task_poll;
        self
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.credentials
            .base_url
            .join(path)
            .map_err(|e| ScalerError::Hypervisor(format!("invalid api path {path}: {e}")))
    }

    async fn login(&self) -> Result<Ticket> {
        let response = self
            .client
            .post(self.url("access/ticket")?)
            .form(&[
                ("username", self.credentials.user.as_str()),
                ("password", self.credentials.password.as_str()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ScalerError::Hypervisor(format!(
                "login as {} rejected ({})",
                self.credentials.user,
                response.status()
            )));
        }

        let body: Envelope<TicketResponse> = response.json().await?;
        info!(user = %self.credentials.user, "Authenticated against Proxmox");
        Ok(Ticket {
            cookie: format!("PVEAuthCookie={}", body.data.ticket),
            csrf_token: body.data.csrf_token,
        })
    }

    async fn current_ticket(&self) -> Result<Ticket> {
        if let Some(ticket) = self.ticket.read().await.as_ref() {
            return Ok(ticket.clone());
        }
        let mut slot = self.ticket.write().await;
        if let Some(ticket) = slot.as_ref() {
            return Ok(ticket.clone());
        }
        let ticket = self.login().await?;
        *slot = Some(ticket.clone());
        Ok(ticket)
    }

    /// Send an authenticated request, logging in again once on 401
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let url = self.url(path)?;
        let mut relogged = false;

        loop {
            let ticket = self.current_ticket().await?;
            let mut builder = self
                .client
                .request(method.clone(), url.clone())
                .header(reqwest::header::COOKIE, &ticket.cookie);
            if method != Method::GET {
                builder = builder.header("CSRFPreventionToken", &ticket.csrf_token);
            }
            builder = if method == Method::GET || method == Method::DELETE {
                builder.query(params)
            } else {
                builder.form(params)
            };

            let response = builder.send().await?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && !relogged {
                debug!(path = %path, "Proxmox ticket expired, logging in again");
                *self.ticket.write().await = None;
                relogged = true;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ScalerError::Hypervisor(format!(
                    "{method} {path} failed ({status}): {body}"
                )));
            }

            let envelope: Envelope<T> = response.json().await?;
            return Ok(envelope.data);
        }
    }

    /// Wait until the task `upid` on `host` has stopped and check its exit status
    async fn wait_task(&self, host: &str, upid: &str) -> Result<()> {
        let path = format!("nodes/{host}/tasks/{upid}/status");
        let path = path.as_str();
        poll_until(&format!("task {upid}"), self.task_poll, move || async move {
            let task: TaskStatus = self.request(Method::GET, path, &[]).await?;
            if task.status != "stopped" {
                return Ok(None);
            }
            match task.exitstatus.as_deref() {
                Some("OK") => Ok(Some(())),
                other => Err(ScalerError::Hypervisor(format!(
                    "task {upid} failed: {}",
                    other.unwrap_or("no exit status")
                ))),
            }
        })
        .await
    }

    async fn wait_task_if_any(&self, host: &str, upid: Option<String>) -> Result<()> {
        match upid {
            Some(upid) => self.wait_task(host, &upid).await,
            None => Ok(()),
        }
    }

    fn vm_path(host: &str, vmid: u32, rest: &str) -> String {
        if rest.is_empty() {
            format!("nodes/{host}/qemu/{vmid}")
        } else {
            format!("nodes/{host}/qemu/{vmid}/{rest}")
        }
    }
}

#[async_trait]
impl HypervisorApi for ProxmoxClient {
    async fn list_hosts(&self) -> Result<Vec<String>> {
        let hosts: Vec<HostEntry> = self.request(Method::GET, "nodes", &[]).await?;
        Ok(hosts.into_iter().map(|h| h.node).collect())
    }

    async fn list_vms(&self, host: &str) -> Result<Vec<VmSummary>> {
        self.request(Method::GET, &format!("nodes/{host}/qemu"), &[])
            .await
    }

    async fn clone_vm(&self, host: &str, template: u32, new_id: u32, name: &str) -> Result<()> {
        let upid: Option<String> = self
            .request(
                Method::POST,
                &Self::vm_path(host, template, "clone"),
                &[("newid", new_id.to_string()), ("name", name.to_string())],
            )
            .await?;
        self.wait_task_if_any(host, upid).await
    }

    async fn configure_vm(&self, host: &str, vmid: u32, update: &VmConfigUpdate) -> Result<()> {
        let _: Value = self
            .request(
                Method::POST,
                &Self::vm_path(host, vmid, "config"),
                &[
                    ("ipconfig0", update.ipconfig0.clone()),
                    ("nameserver", update.nameserver.clone()),
                    ("cores", update.cores.to_string()),
                    ("memory", update.memory_mb.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn start_vm(&self, host: &str, vmid: u32) -> Result<()> {
        let _: Value = self
            .request(Method::POST, &Self::vm_path(host, vmid, "status/start"), &[])
            .await?;
        Ok(())
    }

    async fn shutdown_vm(&self, host: &str, vmid: u32) -> Result<()> {
        let _: Value = self
            .request(
                Method::POST,
                &Self::vm_path(host, vmid, "status/shutdown"),
                &[("forceStop", "1".to_string())],
            )
            .await?;
        Ok(())
    }

    async fn vm_power_state(&self, host: &str, vmid: u32) -> Result<VmPowerState> {
        let current: CurrentStatus = self
            .request(Method::GET, &Self::vm_path(host, vmid, "status/current"), &[])
            .await?;
        Ok(current.status)
    }

    async fn delete_vm(&self, host: &str, vmid: u32) -> Result<()> {
        let upid: Option<String> = self
            .request(Method::DELETE, &Self::vm_path(host, vmid, ""), &[])
            .await?;
        self.wait_task_if_any(host, upid).await
    }

    async fn agent_exec(&self, host: &str, vmid: u32, command: &str) -> Result<u64> {
        let params: Vec<(&str, String)> = command
            .split_whitespace()
            .map(|arg| ("command", arg.to_string()))
            .collect();
        let started: ExecStarted = self
            .request(Method::POST, &Self::vm_path(host, vmid, "agent/exec"), &params)
            .await?;
        Ok(started.pid)
    }

    async fn agent_exec_status(&self, host: &str, vmid: u32, pid: u64) -> Result<ExecStatus> {
        let raw: RawExecStatus = self
            .request(
                Method::GET,
                &Self::vm_path(host, vmid, "agent/exec-status"),
                &[("pid", pid.to_string())],
            )
            .await?;
        Ok(raw.into())
    }

    async fn agent_ipv4_addresses(&self, host: &str, vmid: u32) -> Result<Vec<String>> {
        let interfaces: AgentInterfaces = self
            .request(
                Method::GET,
                &Self::vm_path(host, vmid, "agent/network-get-interfaces"),
                &[],
            )
            .await?;
        Ok(interfaces
            .result
            .into_iter()
            .flat_map(|iface| iface.ip_addresses)
            .filter(|addr| addr.ip_address_type == "ipv4")
            .map(|addr| addr.ip_address)
            .collect())
    }
}
