// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service bundle preparation.
//!
//! An unpacked service image is an OCI bundle: a `rootfs/` plus a runtime
//! spec (`config.json`). Before a service can run, the launcher edits that
//! spec (user, host mounts, network hook), derives the service limits from
//! its annotations, and renders the supervision unit file from a template.
//!
//! Only the fields the launcher touches are typed; everything else in the
//! image's spec is carried through untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Runtime spec file name inside a bundle.
pub const SPEC_FILE: &str = "config.json";
/// Annotation key prefix for launcher settings.
pub const ANNOTATION_PREFIX: &str = "io.edgevisor.";
/// Unit name prefix; the full name is `edgevisor_<id>.service`.
pub const UNIT_PREFIX: &str = "edgevisor_";
/// Unit template file name inside the working directory.
pub const TEMPLATE_FILE: &str = "template.service";

const DEFAULT_UNIT_TEMPLATE: &str = r#"# Template used to launch edgevisor services
# Known variables:
# * ${ID}            - service id
# * ${SERVICEPATH}   - path to service dir
# * ${RUNC}          - path to runc
# * ${SETNETLIMIT}   - command to set net limit
# * ${CLEARNETLIMIT} - command to clear net limit
[Unit]
Description=edgevisor service
After=network.target

[Service]
Type=forking
Restart=always
RestartSec=1
ExecStartPre=${RUNC} delete -f ${ID}
ExecStart=${RUNC} run -d --pid-file ${SERVICEPATH}/.pid -b ${SERVICEPATH} ${ID}
ExecStartPost=${SETNETLIMIT}

ExecStop=${CLEARNETLIMIT}
ExecStop=${RUNC} kill ${ID} SIGKILL
ExecStopPost=${RUNC} delete -f ${ID}
PIDFile=${SERVICEPATH}/.pid

[Install]
WantedBy=multi-user.target
"#;

// ============================================================================
// Runtime spec
// ============================================================================

/// OCI runtime spec (`config.json`), restricted to the fields the launcher edits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeSpec {
    /// Process configuration.
    #[serde(default)]
    pub process: SpecProcess,
    /// Mount points.
    #[serde(default)]
    pub mounts: Vec<SpecMount>,
    /// Lifecycle hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<SpecHooks>,
    /// Free-form annotations.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Untyped remainder of the spec.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Process section of the runtime spec.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecProcess {
    /// Whether to allocate a terminal.
    #[serde(default)]
    pub terminal: bool,
    /// Process identity.
    #[serde(default)]
    pub user: SpecUser,
    /// Untyped remainder.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Process identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecUser {
    /// User ID.
    #[serde(default)]
    pub uid: u32,
    /// Group ID.
    #[serde(default)]
    pub gid: u32,
    /// Untyped remainder.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One mount point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecMount {
    /// Path inside the container.
    pub destination: String,
    /// Mount type.
    #[serde(rename = "type", default)]
    pub mount_type: String,
    /// Host path or device.
    #[serde(default)]
    pub source: String,
    /// Mount options.
    #[serde(default)]
    pub options: Vec<String>,
}

impl SpecMount {
    /// Bind mount of `source` at `destination`.
    pub fn bind(destination: &str, source: &str, read_only: bool) -> Self {
        Self {
            destination: destination.to_string(),
            mount_type: "bind".to_string(),
            source: source.to_string(),
            options: vec![
                "bind".to_string(),
                if read_only { "ro" } else { "rw" }.to_string(),
            ],
        }
    }
}

/// Hook lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecHooks {
    /// Hooks run after the namespaces are created, before the process starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prestart: Vec<SpecHook>,
    /// Untyped remainder.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecHook {
    /// Executable path.
    pub path: String,
    /// Arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl RuntimeSpec {
    /// Read the spec from a bundle directory.
    pub fn load(bundle_dir: &Path) -> Result<Self> {
        let content = fs::read_to_string(bundle_dir.join(SPEC_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the spec to a bundle directory.
    pub fn save(&self, bundle_dir: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(bundle_dir.join(SPEC_FILE), content)?;
        Ok(())
    }

    /// Launcher annotation value for `key` (without prefix).
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations
            .get(&format!("{ANNOTATION_PREFIX}{key}"))
            .map(String::as_str)
    }

    /// Whether a mount with `destination` exists.
    pub fn has_mount(&self, destination: &str) -> bool {
        self.mounts.iter().any(|m| m.destination == destination)
    }
}

/// Inputs for [`prepare_runtime_spec`].
#[derive(Debug, Clone)]
pub struct SpecOptions<'a> {
    /// Working directory; `<working_dir>/etc/` overrides host config files.
    pub working_dir: &'a Path,
    /// Network namespace prestart hook.
    pub netns: &'a Path,
    /// Service user ID.
    pub uid: u32,
    /// Service group ID.
    pub gid: u32,
}

/// Rewrite the bundle's runtime spec for running as a supervised service.
///
/// Disables the terminal, sets the process user, adds host bind mounts and
/// the network namespace hook, and makes sure annotations exist.
pub fn prepare_runtime_spec(bundle_dir: &Path, options: &SpecOptions<'_>) -> Result<RuntimeSpec> {
    let mut spec = RuntimeSpec::load(bundle_dir)
        .map_err(|e| Error::Bundle(format!("failed to read runtime spec: {e}")))?;

    spec.process.terminal = false;
    spec.process.user.uid = options.uid;
    spec.process.user.gid = options.gid;

    for dir in ["/bin", "/sbin", "/lib", "/usr"] {
        spec.mounts.push(SpecMount::bind(dir, dir, true));
    }
    spec.mounts.push(SpecMount::bind("/tmp", "/tmp", false));
    if Path::new("/lib64").exists() {
        spec.mounts.push(SpecMount::bind("/lib64", "/lib64", true));
    }

    for name in ["hosts", "resolv.conf", "nsswitch.conf"] {
        let source = host_config_file(options.working_dir, name);
        spec.mounts.push(SpecMount::bind(
            &format!("/etc/{name}"),
            &source.to_string_lossy(),
            true,
        ));
    }
    spec.mounts.push(SpecMount::bind("/etc/ssl", "/etc/ssl", true));

    spec.hooks.get_or_insert_with(SpecHooks::default).prestart.push(SpecHook {
        path: options.netns.to_string_lossy().into_owned(),
        args: Vec::new(),
    });

    spec.save(bundle_dir)?;

    Ok(spec)
}

/// `<working_dir>/etc/<name>` when present, host `/etc/<name>` otherwise.
fn host_config_file(working_dir: &Path, name: &str) -> PathBuf {
    let local = working_dir.join("etc").join(name);
    if local.exists() {
        std::path::absolute(&local).unwrap_or(local)
    } else {
        Path::new("/etc").join(name)
    }
}

/// Add a read-write bind mount of `source` at `destination` unless a mount
/// at `destination` already exists. Returns true if the spec changed.
pub fn ensure_bind_mount(bundle_dir: &Path, source: &Path, destination: &str) -> Result<bool> {
    let mut spec = RuntimeSpec::load(bundle_dir)?;
    if spec.has_mount(destination) {
        return Ok(false);
    }

    spec.mounts
        .push(SpecMount::bind(destination, &source.to_string_lossy(), false));
    spec.save(bundle_dir)?;
    Ok(true)
}

// ============================================================================
// Limits from annotations
// ============================================================================

/// Service settings carried in runtime spec annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceLimits {
    /// TTL in days.
    pub ttl: u64,
    /// Upload bandwidth limit in bytes.
    pub upload_limit: u64,
    /// Download bandwidth limit in bytes.
    pub download_limit: u64,
    /// Serialized permissions.
    pub permissions: String,
    /// Storage quota in bytes.
    pub storage_limit: u64,
    /// State size limit in bytes.
    pub state_limit: u64,
}

impl ServiceLimits {
    /// Read limits from annotations, using `default_ttl` when the TTL is absent.
    pub fn from_spec(spec: &RuntimeSpec, default_ttl: u64) -> Result<Self> {
        let parse = |key: &str| -> Result<Option<u64>> {
            spec.annotation(key)
                .map(|v| {
                    v.trim().parse::<u64>().map_err(|_| {
                        Error::Bundle(format!("invalid annotation {ANNOTATION_PREFIX}{key}: {v}"))
                    })
                })
                .transpose()
        };

        Ok(Self {
            ttl: parse("service.TTL")?.unwrap_or(default_ttl),
            upload_limit: parse("network.uploadLimit")?.unwrap_or(0),
            download_limit: parse("network.downloadLimit")?.unwrap_or(0),
            permissions: spec.annotation("vis.permissions").unwrap_or_default().to_string(),
            storage_limit: parse("storage.limit")?.unwrap_or(0),
            state_limit: parse("state.limit")?.unwrap_or(0),
        })
    }
}

/// Bandwidth shaping commands for the unit's start and stop hooks.
///
/// Returns empty strings when the spec sets no speed limit. Commands are
/// prefixed with `-` so a shaping failure does not fail the unit.
pub fn net_limit_commands(spec: &RuntimeSpec, wondershaper: &Path) -> (String, String) {
    let mut limits = String::new();
    if let Some(speed) = spec.annotation("network.downloadSpeed") {
        limits.push_str(&format!(" -d {speed}"));
    }
    if let Some(speed) = spec.annotation("network.uploadSpeed") {
        limits.push_str(&format!(" -u {speed}"));
    }

    if limits.is_empty() {
        return (String::new(), String::new());
    }

    let shaper = wondershaper.display();
    (
        format!("-{shaper} -a netnsv0-${{MAINPID}}{limits}"),
        format!("-{shaper} -c -a netnsv0-${{MAINPID}}"),
    )
}

// ============================================================================
// Unit file
// ============================================================================

/// Unit name for a service ID.
pub fn unit_name(id: &str) -> String {
    format!("{UNIT_PREFIX}{id}.service")
}

/// Load `<working_dir>/template.service`, creating it with the built-in
/// template if it does not exist.
pub fn load_unit_template(working_dir: &Path) -> Result<String> {
    let path = working_dir.join(TEMPLATE_FILE);
    match fs::read_to_string(&path) {
        Ok(template) => Ok(template),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "Unit template does not exist, creating default");
            fs::create_dir_all(working_dir)?;
            fs::write(&path, DEFAULT_UNIT_TEMPLATE)?;
            Ok(DEFAULT_UNIT_TEMPLATE.to_string())
        }
        Err(e) => Err(e.into()),
    }
}

/// Values substituted into the unit template.
#[derive(Debug, Clone)]
pub struct UnitParams<'a> {
    /// Service ID.
    pub id: &'a str,
    /// Absolute install directory.
    pub service_path: &'a Path,
    /// runc binary.
    pub runc: &'a Path,
    /// Bandwidth set command.
    pub set_net_limit: &'a str,
    /// Bandwidth clear command.
    pub clear_net_limit: &'a str,
}

/// Render the unit template. Comment lines are dropped.
pub fn render_unit(template: &str, params: &UnitParams<'_>) -> String {
    let runc = params.runc.to_string_lossy();
    let service_path = params.service_path.to_string_lossy();

    template
        .split_inclusive('\n')
        .filter(|line| !line.starts_with('#'))
        .map(|line| {
            line.replace("${RUNC}", &runc)
                .replace("${ID}", params.id)
                .replace("${SERVICEPATH}", &service_path)
                .replace("${SETNETLIMIT}", params.set_net_limit)
                .replace("${CLEARNETLIMIT}", params.clear_net_limit)
        })
        .collect()
}

/// Render and write `<install_dir>/<unit_name>`. Returns the file path.
pub fn write_unit_file(install_dir: &Path, unit_name: &str, content: &str) -> Result<PathBuf> {
    let path = install_dir.join(unit_name);
    fs::write(&path, content)?;
    Ok(path)
}
