//! VPN profile data model (spec §3 "Profile").

use serde::{Deserialize, Serialize};

/// Kind of VPN configuration a profile carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProfileType {
    Wireguard,
    Openvpn,
}

/// A non-main file stored alongside a profile's primary config (e.g. a CA
/// bundle for OpenVPN).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportingFile {
    pub name: String,
    pub contents: Vec<u8>,
}

/// A persisted VPN profile (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(rename = "type")]
    pub profile_type: ProfileType,
    pub config: String,
    pub config_file: Option<String>,
    #[serde(default)]
    pub supporting_files: Vec<SupportingFile>,
    pub interface_name: Option<String>,
    pub bound_interface: Option<String>,
    pub fwmark: u32,
    pub autostart: bool,
}

/// Wire contract for `Create`/`Update` (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertProfileRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub profile_type: ProfileType,
    pub config: String,
    pub config_file: Option<String>,
    /// base64-encoded contents, one entry per supporting file.
    #[serde(default)]
    pub supporting_files: Vec<SupportingFileInput>,
    pub interface_name: Option<String>,
    pub bound_interface: Option<String>,
    #[serde(default)]
    pub autostart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportingFileInput {
    pub name: String,
    /// base64-encoded file contents.
    pub contents: String,
}
