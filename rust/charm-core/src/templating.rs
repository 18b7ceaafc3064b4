//! Renders configuration files and reports whether they changed.
//!
//! Templates are plain functions from a [`Context`] to the file contents. Whether a rendered
//! file counts as changed is decided on its set of lines, so reordering of otherwise identical
//! lines does not restart a workload.
use std::{
    collections::{BTreeMap, BTreeSet},
    io::Write,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use serde::Serialize;
use serde_json::Value;
use snafu::{OptionExt, ResultExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("no template named {template:?}"))]
    UnknownTemplate { template: String },

    #[snafu(display("failed to render template {template:?}"))]
    Render {
        source: RenderError,
        template: String,
    },

    #[snafu(display("failed to read {}", path.display()))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write {}", path.display()))]
    WriteFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to remove {}", path.display()))]
    RemoveFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to change ownership of {}", path.display()))]
    Chown {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to link {} to {}", link.display(), target.display()))]
    Symlink {
        source: std::io::Error,
        link: PathBuf,
        target: PathBuf,
    },

    #[snafu(display("failed to build template context"))]
    BuildContext { source: serde_json::Error },
}

/// Failures inside a template function
#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum RenderError {
    #[snafu(display("context has no value for {key:?}"))]
    MissingKey { key: String },

    #[snafu(display("failed to serialize rendered document"))]
    SerializeDocument { source: serde_yaml::Error },

    #[snafu(display("failed to serialize rendered JSON"))]
    SerializeJson { source: serde_json::Error },
}

/// Values available to templates
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Context(BTreeMap<String, Value>);

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context from any struct that serializes to a map
    pub fn from_serializable(value: &impl Serialize) -> Result<Self> {
        match serde_json::to_value(value).context(BuildContextSnafu)? {
            Value::Object(map) => Ok(Context(map.into_iter().collect())),
            _ => Ok(Context::default()),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|value| !value.is_null())
    }

    /// The value of `key` as text, empty when absent
    pub fn str(&self, key: &str) -> String {
        match self.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    pub fn require(&self, key: &str) -> Result<String, RenderError> {
        Some(self.str(key))
            .filter(|value| !value.is_empty())
            .context(MissingKeySnafu { key })
    }

    pub fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// The value of `key` as a list of strings; scalars become a single element list
    pub fn list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }
}

pub type TemplateFn = fn(&Context) -> Result<String, RenderError>;

/// Named templates known to a role
#[derive(Clone, Default)]
pub struct TemplateSet(BTreeMap<&'static str, TemplateFn>);

impl TemplateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, template: TemplateFn) -> Self {
        self.0.insert(name, template);
        self
    }

    pub fn get(&self, name: &str) -> Option<TemplateFn> {
        self.0.get(name).copied()
    }
}

/// Mode and optional `(uid, gid)` owner of a rendered file
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Perms {
    pub mode: u32,
    pub owner: Option<(u32, u32)>,
}

impl Perms {
    pub const fn mode(mode: u32) -> Self {
        Perms { mode, owner: None }
    }

    pub const fn owned(mode: u32, uid: u32, gid: u32) -> Self {
        Perms {
            mode,
            owner: Some((uid, gid)),
        }
    }
}

impl Default for Perms {
    fn default() -> Self {
        Perms::mode(0o644)
    }
}

/// Writes `contents` to `path` through a temporary file in the same directory
pub fn write_atomically(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file()
        .set_permissions(std::fs::Permissions::from_mode(mode))?;
    file.persist(path)?;
    Ok(())
}

fn line_set(contents: &str) -> BTreeSet<&str> {
    contents.lines().collect()
}

/// Renders templates into files below a filesystem root
pub struct Renderer {
    root: PathBuf,
    templates: TemplateSet,
    manage_ownership: bool,
}

impl Renderer {
    pub fn new(root: impl Into<PathBuf>, templates: TemplateSet) -> Self {
        Renderer {
            root: root.into(),
            templates,
            manage_ownership: true,
        }
    }

    /// Disables `chown`, for unprivileged test runs
    pub fn without_ownership(mut self) -> Self {
        self.manage_ownership = false;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an absolute host path below the root
    pub fn path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    /// Renders `template` into `dest`, returning whether the set of lines changed
    pub fn render(
        &self,
        template: &str,
        dest: &str,
        context: &Context,
        perms: Perms,
    ) -> Result<bool> {
        let render = self
            .templates
            .get(template)
            .context(UnknownTemplateSnafu { template })?;
        let contents = render(context).context(RenderSnafu { template })?;
        self.write(dest, &contents, perms)
    }

    /// Writes raw contents into `dest`, returning whether the set of lines changed
    pub fn write(&self, dest: &str, contents: &str, perms: Perms) -> Result<bool> {
        let path = self.path(dest);
        let existing = self.read(dest)?;

        let changed = match &existing {
            Some(old) => line_set(old)
                .symmetric_difference(&line_set(contents))
                .next()
                .is_some(),
            None => true,
        };

        if existing.as_deref() != Some(contents) {
            tracing::debug!(path = %path.display(), changed, "writing file");
            write_atomically(&path, contents.as_bytes(), perms.mode)
                .context(WriteFileSnafu { path: &path })?;
        } else {
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(perms.mode))
                .context(WriteFileSnafu { path: &path })?;
        }

        if let (Some((uid, gid)), true) = (perms.owner, self.manage_ownership) {
            std::os::unix::fs::chown(&path, Some(uid), Some(gid))
                .context(ChownSnafu { path: &path })?;
        }
        Ok(changed)
    }

    pub fn read(&self, dest: &str) -> Result<Option<String>> {
        let path = self.path(dest);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).context(ReadFileSnafu { path }),
        }
    }

    pub fn exists(&self, dest: &str) -> bool {
        self.path(dest).exists()
    }

    /// Removes `dest`, returning whether there was anything to remove
    pub fn remove(&self, dest: &str) -> Result<bool> {
        let path = self.path(dest);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).context(RemoveFileSnafu { path }),
        }
    }

    /// Points `link` at `target`, replacing whatever was at `link` before
    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        let target = self.path(target);
        let link = self.path(link);
        if std::fs::read_link(&link).is_ok_and(|current| current == target) {
            return Ok(());
        }
        let context = SymlinkSnafu {
            link: &link,
            target: &target,
        };
        if let Some(dir) = link.parent() {
            std::fs::create_dir_all(dir).context(context)?;
        }
        if link.symlink_metadata().is_ok() {
            std::fs::remove_file(&link).context(context)?;
        }
        std::os::unix::fs::symlink(&target, &link).context(context)
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn greeting(context: &Context) -> Result<String, RenderError> {
        Ok(format!("[DEFAULT]\nname = {}\nport = 8082\n", context.require("name")?))
    }

    fn renderer(dir: &Path) -> Renderer {
        Renderer::new(dir, TemplateSet::new().with("greeting", greeting)).without_ownership()
    }

    #[test]
    fn render_reports_changes() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = renderer(dir.path());
        let context = Context::new().with("name", "control");

        assert!(renderer
            .render("greeting", "/etc/contrail/test.conf", &context, Perms::mode(0o440))
            .unwrap());
        assert!(!renderer
            .render("greeting", "/etc/contrail/test.conf", &context, Perms::mode(0o440))
            .unwrap());

        let path = dir.path().join("etc/contrail/test.conf");
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "[DEFAULT]\nname = control\nport = 8082\n"
        );
        assert_eq!(
            std::fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            0o440
        );

        let context = Context::new().with("name", "config");
        assert!(renderer
            .render("greeting", "/etc/contrail/test.conf", &context, Perms::mode(0o440))
            .unwrap());
    }

    #[test]
    fn reordered_lines_are_not_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = renderer(dir.path());
        assert!(renderer
            .write("/a.conf", indoc! {"
                a = 1
                b = 2
            "}, Perms::default())
            .unwrap());
        assert!(!renderer
            .write("/a.conf", indoc! {"
                b = 2
                a = 1
            "}, Perms::default())
            .unwrap());
        assert_eq!(renderer.read("/a.conf").unwrap().unwrap(), "b = 2\na = 1\n");
    }

    #[test]
    fn missing_values_fail_rendering() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = renderer(dir.path());
        assert!(matches!(
            renderer.render("greeting", "/x.conf", &Context::new(), Perms::default()),
            Err(Error::Render { .. })
        ));
        assert!(matches!(
            renderer.render("nope", "/x.conf", &Context::new(), Perms::default()),
            Err(Error::UnknownTemplate { .. })
        ));
        assert!(!renderer.exists("/x.conf"));
    }

    #[test]
    fn symlinks_and_removal() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = renderer(dir.path());
        renderer
            .write("/ssl/vrouter/certs/server.pem", "CERT\n", Perms::default())
            .unwrap();
        renderer
            .symlink("/ssl/vrouter/certs/server.pem", "/ssl/certs/server.pem")
            .unwrap();
        renderer
            .symlink("/ssl/vrouter/certs/server.pem", "/ssl/certs/server.pem")
            .unwrap();
        assert_eq!(renderer.read("/ssl/certs/server.pem").unwrap().unwrap(), "CERT\n");

        assert!(renderer.remove("/ssl/vrouter/certs/server.pem").unwrap());
        assert!(!renderer.remove("/ssl/vrouter/certs/server.pem").unwrap());
    }

    #[test]
    fn context_accessors() {
        let context = Context::new()
            .with("servers", serde_json::json!(["10.0.0.1", "10.0.0.2"]))
            .with("single", "10.0.0.3")
            .with("port", 8082)
            .with("ssl", true);
        assert_eq!(context.list("servers"), vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(context.list("single"), vec!["10.0.0.3"]);
        assert!(context.list("missing").is_empty());
        assert_eq!(context.str("port"), "8082");
        assert!(context.flag("ssl"));
    }
}
