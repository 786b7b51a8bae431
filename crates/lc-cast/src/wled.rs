//! WLED JSON API client.
//!
//! Used only at cast Opening and Closing: live-mode grab/release,
//! matrix auto-sizing, and file upload helpers. The client owns a
//! small tokio runtime so the thread-based cast loop can make blocking
//! calls without an async surface leaking into the capture path.

use std::path::Path;
use std::time::Duration;

use lc_common::{CastError, CastResult};

/// WLED negotiation timeout.
const TIMEOUT: Duration = Duration::from_secs(1);
/// WLED filenames: leading slash plus name must fit 32 bytes.
const NAME_BUDGET: usize = 30;

/// Device facts read from `/json/info`.
#[derive(Debug, Clone, Default)]
pub struct WledInfo {
    pub matrix_w: u32,
    pub matrix_h: u32,
    /// Filesystem total / used KiB, for upload budgeting.
    pub fs_total: u64,
    pub fs_used: u64,
}

pub struct WledClient {
    http: reqwest::Client,
    rt: tokio::runtime::Runtime,
}

impl WledClient {
    pub fn new() -> CastResult<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CastError::Internal(e.into()))?;
        let http = reqwest::Client::builder()
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| CastError::Internal(e.into()))?;
        Ok(Self { http, rt })
    }

    /// Read `/json/info`; `leds.matrix` is absent on non-2D setups and
    /// reported as 1x1 there.
    pub fn info(&self, host: &str) -> CastResult<WledInfo> {
        let url = format!("http://{host}/json/info");
        let body: serde_json::Value = self
            .rt
            .block_on(async { self.http.get(&url).send().await?.json().await })
            .map_err(|e| CastError::DeviceUnreachable(format!("{host}: {e}")))?;
        let matrix = &body["leds"]["matrix"];
        Ok(WledInfo {
            matrix_w: matrix["w"].as_u64().unwrap_or(1) as u32,
            matrix_h: matrix["h"].as_u64().unwrap_or(1) as u32,
            fs_total: body["fs"]["t"].as_u64().unwrap_or(0),
            fs_used: body["fs"]["u"].as_u64().unwrap_or(0),
        })
    }

    /// Matrix dimensions for auto-sizing the cast.
    pub fn matrix_dimensions(&self, host: &str) -> CastResult<(u32, u32)> {
        let info = self.info(host)?;
        tracing::info!(host, w = info.matrix_w, h = info.matrix_h, "WLED matrix");
        Ok((info.matrix_w, info.matrix_h))
    }

    /// Grab or release realtime control: `POST /json {on, live}`.
    /// Returns false (with a log line) instead of failing, so Closing
    /// can always run it.
    pub fn set_live(&self, host: &str, on: bool, live: bool) -> bool {
        let url = format!("http://{host}/json");
        let result = self.rt.block_on(async {
            self.http
                .post(&url)
                .json(&serde_json::json!({ "on": on, "live": live }))
                .send()
                .await?
                .error_for_status()
        });
        match result {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(host, on, live, error = %e, "WLED live-mode request failed");
                false
            }
        }
    }

    /// `HEAD /<filename>` existence probe.
    pub fn file_exists(&self, host: &str, filename: &str) -> bool {
        let url = format!("http://{host}/{}", filename.trim_start_matches('/'));
        self.rt
            .block_on(async { self.http.head(&url).send().await })
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }

    /// Push a file to the device filesystem via `POST /upload`.
    pub fn upload_file(&self, host: &str, path: &Path) -> CastResult<String> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CastError::BadConfig(format!("bad upload path {}", path.display())))?;
        let wled_name = wled_name_format(filename);
        let bytes = std::fs::read(path)?;

        let info = self.info(host)?;
        let free_kib = info.fs_total.saturating_sub(info.fs_used);
        if info.fs_total > 0 && (bytes.len() as u64 / 1024) + 1 > free_kib {
            return Err(CastError::BadConfig(format!(
                "{host} has {free_kib} KiB free, upload needs {} KiB",
                bytes.len() / 1024 + 1
            )));
        }

        let url = format!("http://{host}/upload");
        let upload_name = format!("/{wled_name}");
        let result = self.rt.block_on(async {
            let part = reqwest::multipart::Part::bytes(bytes).file_name(upload_name.clone());
            let form = reqwest::multipart::Form::new().part("file", part);
            self.http
                .post(&url)
                .multipart(form)
                .send()
                .await?
                .error_for_status()
        });
        result.map_err(|e| CastError::DeviceUnreachable(format!("{host} upload: {e}")))?;
        tracing::info!(host, name = %wled_name, "file uploaded to WLED");
        Ok(wled_name)
    }
}

/// Fit a filename into the WLED 30-character budget, keeping the
/// extension and trimming the stem.
pub fn wled_name_format(name: &str) -> String {
    let name = name.replace(' ', "_");
    if name.len() <= NAME_BUDGET {
        return name;
    }
    match name.rsplit_once('.') {
        Some((stem, ext)) if ext.len() + 1 < NAME_BUDGET => {
            let keep = NAME_BUDGET - ext.len() - 1;
            format!("{}.{ext}", &stem[..keep.min(stem.len())])
        }
        _ => name[..NAME_BUDGET].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_names_unchanged() {
        assert_eq!(wled_name_format("anim.gif"), "anim.gif");
    }

    #[test]
    fn long_names_keep_extension_within_budget() {
        let name = wled_name_format("a-very-long-animation-name-that-overflows.gif");
        assert!(name.len() <= 30, "{name}");
        assert!(name.ends_with(".gif"));
    }

    #[test]
    fn spaces_replaced() {
        assert_eq!(wled_name_format("my anim.gif"), "my_anim.gif");
    }
}
