//! WiFi transport capability
//!
//! Talks to a board's HTTP file API on the local network. Files live under
//! `/fs/`: GET reads a file, GET with a trailing slash lists a directory as
//! JSON, PUT writes, PUT with a trailing slash creates a directory, DELETE
//! removes. Boards protected with a password expect it via HTTP basic auth.

use crate::transfer::{
    BoardService, DirectoryEntry, FileTransferClient, FileTransferError, PeripheralIdentity,
};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WifiPeripheral {
    host: String,
    port: u16,
    name: Option<String>,
    password: Option<String>,
    client: reqwest::Client,
    enabled: AtomicBool,
    detached: AtomicBool,
}

impl WifiPeripheral {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, FileTransferError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| FileTransferError::Transport(e.to_string()))?;
        Ok(Self {
            host: host.into(),
            port,
            name: None,
            password: None,
            client,
            enabled: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        })
    }

    /// Friendly name from the credential store, when one is known.
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Base address of the board's HTTP API. The default port is left
    /// implicit.
    pub fn base_url(&self) -> String {
        if self.port == 80 {
            format!("http://{}", self.host)
        } else {
            format!("http://{}:{}", self.host, self.port)
        }
    }

    fn fs_url(&self, path: &str) -> String {
        format!("{}/fs/{}", self.base_url(), path.trim_start_matches('/'))
    }

    fn dir_url(&self, path: &str) -> String {
        let url = self.fs_url(path);
        if url.ends_with('/') {
            url
        } else {
            format!("{url}/")
        }
    }

    fn guard(&self) -> Result<(), FileTransferError> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(FileTransferError::Detached);
        }
        Ok(())
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.password {
            Some(password) => request.basic_auth("", Some(password)),
            None => request,
        }
    }

    fn http_err(e: reqwest::Error) -> FileTransferError {
        FileTransferError::Transport(e.to_string())
    }
}

#[async_trait::async_trait]
impl FileTransferClient for WifiPeripheral {
    fn identity(&self) -> PeripheralIdentity {
        PeripheralIdentity::Wifi {
            host: self.host.clone(),
            port: self.port,
        }
    }

    fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.host.clone())
    }

    async fn discover(&self, _filter: &[BoardService]) -> Result<(), FileTransferError> {
        self.guard()?;
        // The version endpoint doubles as a reachability/capability probe.
        let url = format!("{}/cp/version.json", self.base_url());
        let response = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(|e| FileTransferError::DiscoveringServices(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FileTransferError::DiscoveringServices(format!(
                "version probe returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn enable_file_transfer(&self) -> Result<(), FileTransferError> {
        self.guard()?;
        let response = self
            .authorize(self.client.get(self.dir_url("/")))
            .send()
            .await
            .map_err(Self::http_err)?;
        match response.status() {
            StatusCode::UNAUTHORIZED => Err(FileTransferError::Transport(
                "board rejected the stored password".to_string(),
            )),
            status if status.is_success() => {
                self.enabled.store(true, Ordering::SeqCst);
                Ok(())
            }
            status => Err(FileTransferError::Transport(format!(
                "file API probe returned {status}"
            ))),
        }
    }

    fn is_file_transfer_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) && !self.detached.load(Ordering::SeqCst)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FileTransferError> {
        self.guard()?;
        let response = self
            .authorize(self.client.get(self.fs_url(path)))
            .send()
            .await
            .map_err(Self::http_err)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(FileTransferError::Transport(format!(
                "{path}: no such file"
            )));
        }
        if !response.status().is_success() {
            return Err(FileTransferError::Transport(format!(
                "read returned {}",
                response.status()
            )));
        }
        Ok(response.bytes().await.map_err(Self::http_err)?.to_vec())
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FileTransferError> {
        self.guard()?;
        let response = self
            .authorize(self.client.put(self.fs_url(path)))
            .body(data.to_vec())
            .send()
            .await
            .map_err(Self::http_err)?;
        if !response.status().is_success() {
            return Err(FileTransferError::Transport(format!(
                "write returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn delete_file(&self, path: &str) -> Result<bool, FileTransferError> {
        self.guard()?;
        let response = self
            .authorize(self.client.delete(self.fs_url(path)))
            .send()
            .await
            .map_err(Self::http_err)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(FileTransferError::Transport(format!(
                "delete returned {status}"
            ))),
        }
    }

    async fn make_directory(&self, path: &str) -> Result<bool, FileTransferError> {
        self.guard()?;
        let response = self
            .authorize(self.client.put(self.dir_url(path)))
            .send()
            .await
            .map_err(Self::http_err)?;
        match response.status() {
            StatusCode::CREATED => Ok(true),
            // Already present.
            StatusCode::NO_CONTENT => Ok(false),
            status if status.is_success() => Ok(true),
            status => Err(FileTransferError::Transport(format!(
                "mkdir returned {status}"
            ))),
        }
    }

    async fn list_directory(
        &self,
        path: &str,
    ) -> Result<Option<Vec<DirectoryEntry>>, FileTransferError> {
        self.guard()?;
        let response = self
            .authorize(self.client.get(self.dir_url(path)))
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(Self::http_err)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(FileTransferError::Transport(format!(
                "listdir returned {}",
                response.status()
            )));
        }
        let entries: Vec<DirectoryEntry> = response
            .json()
            .await
            .map_err(|e| FileTransferError::Protocol(e.to_string()))?;
        Ok(Some(entries))
    }

    fn detach(&self) {
        self.detached.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_suppresses_default_port() {
        let peripheral = WifiPeripheral::new("10.0.0.5", 80).unwrap();
        assert_eq!(peripheral.base_url(), "http://10.0.0.5");

        let peripheral = WifiPeripheral::new("10.0.0.5", 8080).unwrap();
        assert_eq!(peripheral.base_url(), "http://10.0.0.5:8080");
    }

    #[test]
    fn display_name_falls_back_to_address() {
        let peripheral = WifiPeripheral::new("10.0.0.5", 80).unwrap();
        assert_eq!(peripheral.display_name(), "10.0.0.5");

        let peripheral = peripheral.with_name(Some("workbench".to_string()));
        assert_eq!(peripheral.display_name(), "workbench");
    }

    #[test]
    fn identity_carries_host_and_port() {
        let peripheral = WifiPeripheral::new("10.0.0.5", 8080).unwrap();
        assert_eq!(
            peripheral.identity(),
            PeripheralIdentity::Wifi {
                host: "10.0.0.5".to_string(),
                port: 8080
            }
        );
    }

    #[tokio::test]
    async fn detached_transport_fails_without_touching_the_network() {
        let peripheral = WifiPeripheral::new("10.0.0.5", 80).unwrap();
        peripheral.detach();
        assert_eq!(
            peripheral.read_file("/code.py").await.unwrap_err(),
            FileTransferError::Detached
        );
        assert!(!peripheral.is_file_transfer_enabled());
    }

    #[test]
    fn listing_json_shape() {
        let json = r#"[
            {"name": "code.py", "directory": false, "file_size": 421, "modified_ns": 1700000000000000000},
            {"name": "lib", "directory": true}
        ]"#;
        let entries: Vec<DirectoryEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(entries[0].name, "code.py");
        assert!(!entries[0].is_directory);
        assert_eq!(entries[0].file_size, 421);
        assert!(entries[1].is_directory);
        assert_eq!(entries[1].file_size, 0);
    }
}
