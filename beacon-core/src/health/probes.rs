//! Ready-made probes for common dependencies
//!
//! Each factory wraps a caller-supplied operation and maps its outcome onto
//! the three health levels. The probes never return `Err` themselves; a
//! failing dependency becomes an unhealthy result carrying its message.

use super::checker::{probe_fn, HealthCheckResult, HealthProbe};
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

/// Timeout for [`http_service`] requests
pub const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default usage threshold for the resource probes
pub const DEFAULT_THRESHOLD_PERCENT: f64 = 90.0;

/// Database reachability: `ping` succeeding means healthy
pub fn database<F, Fut>(name: impl Into<String>, ping: F) -> impl HealthProbe
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let name = name.into();
    probe_fn(move || {
        let name = name.clone();
        let pending = ping();
        async move {
            Ok(match pending.await {
                Ok(()) => HealthCheckResult::healthy(name).with_message("Database connection OK"),
                Err(err) => HealthCheckResult::unhealthy(name, format!("{err:#}")),
            })
        }
    })
}

/// Cache reachability: `ping` must answer `PONG`, anything else is degraded
pub fn cache<F, Fut>(name: impl Into<String>, ping: F) -> impl HealthProbe
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    let name = name.into();
    probe_fn(move || {
        let name = name.clone();
        let pending = ping();
        async move {
            Ok(match pending.await {
                Ok(reply) if reply == "PONG" => {
                    HealthCheckResult::healthy(name).with_message("Cache connection OK")
                }
                Ok(reply) => {
                    HealthCheckResult::degraded(name, format!("Unexpected response: {reply}"))
                }
                Err(err) => HealthCheckResult::unhealthy(name, format!("{err:#}")),
            })
        }
    })
}

/// Upstream HTTP dependency probed with `GET`
pub struct HttpServiceProbe {
    name: String,
    url: String,
    expected_status: u16,
    client: reqwest::Client,
}

#[async_trait]
impl HealthProbe for HttpServiceProbe {
    async fn check(&self) -> anyhow::Result<HealthCheckResult> {
        let result = match self.client.get(&self.url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if status == self.expected_status {
                    HealthCheckResult::healthy(self.name.as_str())
                        .with_message(format!("Service responded with {status}"))
                } else {
                    HealthCheckResult::degraded(
                        self.name.as_str(),
                        format!("Unexpected status: {status}"),
                    )
                }
            }
            Err(err) => HealthCheckResult::unhealthy(self.name.as_str(), err.to_string()),
        };
        Ok(result)
    }
}

/// Probe an HTTP endpoint, expecting `expected_status`. Requests are
/// aborted after [`HTTP_PROBE_TIMEOUT`].
pub fn http_service(
    name: impl Into<String>,
    url: impl Into<String>,
    expected_status: u16,
) -> Result<HttpServiceProbe, reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(HTTP_PROBE_TIMEOUT)
        .build()?;
    Ok(HttpServiceProbe {
        name: name.into(),
        url: url.into(),
        expected_status,
        client,
    })
}

/// Generic usage probe: `sample` returns a percentage, at or above
/// `threshold_percent` is degraded. The probe name doubles as the resource
/// word in its messages ("High disk usage: 93.0%").
pub fn threshold<F>(
    name: impl Into<String>,
    threshold_percent: f64,
    sample: F,
) -> impl HealthProbe
where
    F: Fn() -> anyhow::Result<f64> + Send + Sync + 'static,
{
    let name = name.into();
    probe_fn(move || {
        let result = match sample() {
            Ok(used) if used >= threshold_percent => HealthCheckResult::degraded(
                name.as_str(),
                format!("High {name} usage: {used:.1}%"),
            ),
            Ok(used) => HealthCheckResult::healthy(name.as_str())
                .with_message(format!("{} usage: {used:.1}%", capitalize(&name))),
            Err(err) => HealthCheckResult::unhealthy(name.as_str(), format!("{err:#}")),
        };
        async move { Ok(result) }
    })
}

/// System memory usage probe
pub fn memory(name: impl Into<String>, threshold_percent: f64) -> impl HealthProbe {
    threshold(name, threshold_percent, memory_usage_percent)
}

/// Filesystem usage probe for the filesystem holding `path`
pub fn disk_space(
    name: impl Into<String>,
    path: impl Into<PathBuf>,
    threshold_percent: f64,
) -> impl HealthProbe {
    let path = path.into();
    threshold(name, threshold_percent, move || disk_usage_percent(&path))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Percentage of physical memory in use
#[cfg(target_os = "linux")]
fn memory_usage_percent() -> anyhow::Result<f64> {
    use std::mem::MaybeUninit;

    let mut info: MaybeUninit<libc::sysinfo> = MaybeUninit::uninit();
    let info = unsafe {
        if libc::sysinfo(info.as_mut_ptr()) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        info.assume_init()
    };

    let unit = u64::from(info.mem_unit.max(1));
    let total = info.totalram as u64 * unit;
    let free = (info.freeram as u64 + info.bufferram as u64) * unit;
    usage_percent(total, free)
}

#[cfg(not(target_os = "linux"))]
fn memory_usage_percent() -> anyhow::Result<f64> {
    anyhow::bail!("memory usage is not available on this platform")
}

/// Percentage of filesystem blocks in use
#[cfg(unix)]
fn disk_usage_percent(path: &std::path::Path) -> anyhow::Result<f64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())?;
    let mut stat: MaybeUninit<libc::statvfs> = MaybeUninit::uninit();
    let stat = unsafe {
        if libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        stat.assume_init()
    };

    let block = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * block;
    let available = stat.f_bavail as u64 * block;
    usage_percent(total, available)
}

#[cfg(not(unix))]
fn disk_usage_percent(_path: &std::path::Path) -> anyhow::Result<f64> {
    anyhow::bail!("disk usage is not available on this platform")
}

fn usage_percent(total: u64, available: u64) -> anyhow::Result<f64> {
    if total == 0 {
        anyhow::bail!("reported capacity is zero");
    }
    let used = total.saturating_sub(available);
    Ok(used as f64 / total as f64 * 100.0)
}
