//! Server certificates delivered over the `tls-certificates` relation.
use const_format::concatcp;
use serde::Serialize;
use snafu::{ResultExt, Snafu};

use crate::{
    hookenv::Settings,
    kv::RelationBag,
    templating::{self, Perms, Renderer},
    CONFIGS_DIR,
};

type Result<T, E = Error> = std::result::Result<T, E>;

pub const SSL_DIR: &str = concatcp!(CONFIGS_DIR, "/ssl");

/// Group of the in-container service users that need to read the private key
pub const CONTRAIL_GID: u32 = 1011;

const CERT_FILE: &str = "certs/server.pem";
const KEY_FILE: &str = "private/server-privkey.pem";
const CA_FILE: &str = "certs/ca-cert.pem";

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to encode certificate request"))]
    EncodeRequest { source: serde_json::Error },

    #[snafu(display("failed to install certificates for {module}"))]
    Install {
        source: templating::Error,
        module: String,
    },
}

/// Everything needed to request a certificate for this unit
#[derive(Clone, Debug, Serialize)]
pub struct CertificateRequest {
    pub common_name: String,
    pub sans: Vec<String>,
    pub certificate_name: String,
}

impl CertificateRequest {
    /// Requests a certificate named after the host, valid for all of `addresses`
    pub fn new(hostname: &str, addresses: impl IntoIterator<Item = String>) -> Self {
        let mut sans: Vec<String> = addresses.into_iter().filter(|a| !a.is_empty()).collect();
        sans.push(hostname.to_string());
        sans.dedup();
        CertificateRequest {
            common_name: hostname.to_string(),
            sans,
            certificate_name: hostname.to_string(),
        }
    }

    pub fn to_settings(&self) -> Result<Settings> {
        Ok(Settings::from([
            ("common_name".to_string(), Some(self.common_name.clone())),
            (
                "sans".to_string(),
                Some(serde_json::to_string(&self.sans).context(EncodeRequestSnafu)?),
            ),
            (
                "certificate_name".to_string(),
                Some(self.certificate_name.clone()),
            ),
        ]))
    }
}

/// A server certificate, its key, and the issuing CA
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertificateBundle {
    pub ca: String,
    pub cert: String,
    pub key: String,
}

impl CertificateBundle {
    /// Picks the certificate for `unit` out of the issuer's bag, if it was issued yet
    pub fn from_bag(bag: &RelationBag, unit: &str) -> Option<Self> {
        let prefix = unit.replace('/', "_");
        Some(CertificateBundle {
            ca: bag.get("ca")?.to_string(),
            cert: bag.get(&format!("{prefix}.server.cert"))?.to_string(),
            key: bag.get(&format!("{prefix}.server.key"))?.to_string(),
        })
    }
}

fn module_file(module: &str, file: &str) -> String {
    format!("{SSL_DIR}/{module}/{file}")
}

fn shared_file(file: &str) -> String {
    format!("{SSL_DIR}/{file}")
}

fn with_newline(contents: &str) -> String {
    let mut contents = contents.trim_end().to_string();
    contents.push('\n');
    contents
}

/// Writes the bundle for `module` and links the shared locations to it; returns whether any
/// file changed
pub fn install(renderer: &Renderer, module: &str, bundle: &CertificateBundle) -> Result<bool> {
    let files = [
        (CERT_FILE, &bundle.cert, Perms::mode(0o644)),
        (KEY_FILE, &bundle.key, Perms::owned(0o640, 0, CONTRAIL_GID)),
        (CA_FILE, &bundle.ca, Perms::mode(0o644)),
    ];
    let mut changed = false;
    for (file, contents, perms) in files {
        let target = module_file(module, file);
        changed |= renderer
            .write(&target, &with_newline(contents), perms)
            .context(InstallSnafu { module })?;
        renderer
            .symlink(&target, &shared_file(file))
            .context(InstallSnafu { module })?;
    }
    if changed {
        tracing::info!(module, "installed server certificates");
    }
    Ok(changed)
}

/// Removes the files of `module`; returns whether anything was there
pub fn remove(renderer: &Renderer, module: &str) -> Result<bool> {
    let mut removed = false;
    for file in [CERT_FILE, KEY_FILE, CA_FILE] {
        removed |= renderer
            .remove(&module_file(module, file))
            .context(InstallSnafu { module })?;
        renderer
            .remove(&shared_file(file))
            .context(InstallSnafu { module })?;
    }
    Ok(removed)
}

pub fn ca_path(module: &str) -> String {
    module_file(module, CA_FILE)
}

pub fn cert_path(module: &str) -> String {
    module_file(module, CERT_FILE)
}

pub fn key_path(module: &str) -> String {
    module_file(module, KEY_FILE)
}
