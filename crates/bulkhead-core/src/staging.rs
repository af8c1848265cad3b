//! Execution root staging
//!
//! Every spawn gets its own directory `<scratch_dir>/<pid>-<seq>`. Sibling roots are
//! created concurrently without locks: `create_dir` fails with `AlreadyExists` on a name
//! clash and the next sequence number is tried.
//!
//! In [`StagingMode::Bind`] only mount points are created on the host; the sandbox child
//! performs the bind mounts inside its private mount namespace, so nothing is ever mounted
//! in the host namespace. [`StagingMode::Copy`] copies inputs into place instead and is
//! used when no mount namespace is available.

use crate::config::ExecutorConfig;
use crate::spec::{Identity, SpawnSpec, normalize};
use crate::{Result, SandboxError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Directory inside the root that the old root is pivoted onto
pub const OLD_ROOT: &str = ".bulkhead-old-root";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// How inputs are made visible inside the root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingMode {
    /// Create mount points; the child bind-mounts the real paths
    Bind,
    /// Copy inputs into the root, files read-only
    Copy,
}

/// How a bind mount is applied inside the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindKind {
    /// Remounted read-only
    ReadOnly,
    /// Device node, left writable so `/dev/null` can be written
    Device,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    /// Absolute host path
    pub source: PathBuf,
    /// Path relative to the root
    pub target: PathBuf,
    pub kind: BindKind,
}

/// Mounts the sandbox child performs, all relative to the execution root
#[derive(Debug, Clone, Default)]
pub struct MountPlan {
    /// System paths, devices and inputs, in creation order (parents first)
    pub binds: Vec<BindMount>,
    /// Output directories, self-bound so they stay writable under a read-only root
    pub writable: Vec<PathBuf>,
    /// Scratch directories, each backed by a fresh tmpfs
    pub tmpfs: Vec<PathBuf>,
}

/// Builds execution roots under the configured scratch directory
#[derive(Debug)]
pub struct ExecutionRootBuilder<'a> {
    config: &'a ExecutorConfig,
    owner: Option<Identity>,
}

impl<'a> ExecutionRootBuilder<'a> {
    #[must_use]
    pub const fn new(config: &'a ExecutorConfig) -> Self {
        Self {
            config,
            owner: None,
        }
    }

    /// Hand writable directories to `identity` (only meaningful when running as root)
    #[must_use]
    pub const fn owner(mut self, identity: Identity) -> Self {
        self.owner = Some(identity);
        self
    }

    /// Stage a fresh root for `spec`.
    ///
    /// On failure the partially built tree is removed before `StagingFailed` is returned.
    pub fn stage(&self, spec: &SpawnSpec, mode: StagingMode) -> Result<ExecutionRoot> {
        spec.validate()?;

        let path = create_unique_dir(&self.config.scratch_dir)?;
        let mut root = ExecutionRoot {
            path,
            host_root: spec.host_root.clone(),
            outputs: spec.outputs.iter().map(|p| normalize(p)).collect(),
            mode,
            plan: MountPlan::default(),
            torn_down: false,
            kept: false,
        };

        match self.populate(&mut root, spec) {
            Ok(()) => {
                tracing::info!(
                    root = %root.path.display(),
                    ?mode,
                    inputs = spec.inputs.len(),
                    outputs = spec.outputs.len(),
                    "execution root staged"
                );
                Ok(root)
            }
            Err(e) => {
                if let Err(cleanup) = root.teardown() {
                    tracing::warn!(error = %cleanup, "failed to remove partially staged root");
                }
                Err(e)
            }
        }
    }

    fn populate(&self, root: &mut ExecutionRoot, spec: &SpawnSpec) -> Result<()> {
        let base = root.path.clone();
        let mut reserved: Vec<PathBuf> = Vec::new();

        if root.mode == StagingMode::Bind {
            fs::create_dir(base.join(OLD_ROOT))
                .map_err(|e| SandboxError::staging("failed to create old root mount point", e))?;

            for system in &self.config.system_paths {
                let Some(target) = relative_to_root(system) else {
                    continue;
                };
                if reserved.iter().any(|r| target.starts_with(r)) {
                    continue;
                }
                if stage_system_path(&base, system, &target, &mut root.plan)? {
                    reserved.push(target);
                }
            }

            for device in &self.config.devices {
                let Some(target) = relative_to_root(device) else {
                    continue;
                };
                if fs::metadata(device).is_err() {
                    tracing::debug!(device = %device.display(), "device not present on host, skipping");
                    continue;
                }
                create_mount_point(&base.join(&target), false)?;
                root.plan.binds.push(BindMount {
                    source: resolve_source(device)?,
                    target: target.clone(),
                    kind: BindKind::Device,
                });
                reserved.push(target);
            }
        }

        let declared = spec
            .inputs
            .keys()
            .chain(spec.outputs.iter())
            .chain(spec.scratch.iter());
        for path in declared {
            let path = normalize(path);
            if let Some(system) = reserved.iter().find(|r| path.starts_with(r)) {
                return Err(SandboxError::staging_msg(format!(
                    "{} collides with system path /{}",
                    path.display(),
                    system.display()
                )));
            }
        }

        for (target, source) in &spec.inputs {
            let target = normalize(target);
            let meta = fs::metadata(source).map_err(|e| {
                SandboxError::staging(format!("input {} is not available", source.display()), e)
            })?;
            let dest = base.join(&target);
            ensure_parent(&dest)?;

            match root.mode {
                StagingMode::Bind => {
                    create_mount_point(&dest, meta.is_dir())?;
                    root.plan.binds.push(BindMount {
                        source: resolve_source(source)?,
                        target,
                        kind: BindKind::ReadOnly,
                    });
                }
                StagingMode::Copy => {
                    copy_input(source, &dest, meta.is_dir()).map_err(|e| {
                        SandboxError::staging(format!("failed to copy input {}", source.display()), e)
                    })?;
                }
            }
        }

        for output in &root.outputs {
            let dir = base.join(output);
            create_writable_dir(&dir, self.owner)?;
            if root.mode == StagingMode::Bind {
                root.plan.writable.push(output.clone());
            }
        }

        for scratch in &spec.scratch {
            let scratch = normalize(scratch);
            create_writable_dir(&base.join(&scratch), self.owner)?;
            if root.mode == StagingMode::Bind {
                root.plan.tmpfs.push(scratch);
            }
        }

        let workdir = normalize(&spec.workdir);
        let inside_input = spec.inputs.keys().any(|i| workdir.starts_with(normalize(i)));
        if !inside_input {
            fs::create_dir_all(base.join(&workdir)).map_err(|e| {
                SandboxError::staging(
                    format!("failed to create working directory {}", workdir.display()),
                    e,
                )
            })?;
        }

        Ok(())
    }
}

/// A staged directory tree owned by one spawn
#[derive(Debug)]
pub struct ExecutionRoot {
    path: PathBuf,
    host_root: PathBuf,
    outputs: Vec<PathBuf>,
    mode: StagingMode,
    plan: MountPlan,
    torn_down: bool,
    kept: bool,
}

impl ExecutionRoot {
    /// Host path of the root
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn mode(&self) -> StagingMode {
        self.mode
    }

    /// Mounts the sandbox child has to perform
    #[must_use]
    pub const fn mount_plan(&self) -> &MountPlan {
        &self.plan
    }

    /// Move every declared output's contents into `host_root/<output>`.
    ///
    /// Entries already present at the destination are replaced. Returns the number of
    /// entries moved.
    pub fn materialize_outputs(&self) -> Result<usize> {
        let mut moved = 0;
        for output in &self.outputs {
            let src = self.path.join(output);
            let dst = self.host_root.join(output);
            fs::create_dir_all(&dst).map_err(|e| {
                SandboxError::staging(format!("failed to create output {}", dst.display()), e)
            })?;

            let entries = fs::read_dir(&src).map_err(|e| {
                SandboxError::staging(format!("failed to read output {}", src.display()), e)
            })?;
            for entry in entries {
                let entry = entry?;
                let target = dst.join(entry.file_name());
                move_entry(&entry.path(), &target).map_err(|e| {
                    SandboxError::staging(
                        format!("failed to materialize {}", target.display()),
                        e,
                    )
                })?;
                moved += 1;
            }
        }

        tracing::debug!(root = %self.path.display(), moved, "outputs materialized");
        Ok(moved)
    }

    /// Keep the tree on disk for diagnostics; later teardowns become no-ops
    pub fn keep(&mut self) {
        if !self.kept {
            tracing::info!(root = %self.path.display(), "keeping execution root for inspection");
        }
        self.kept = true;
    }

    /// Recursively remove the root. Safe to call any number of times.
    pub fn teardown(&mut self) -> Result<()> {
        if self.torn_down || self.kept {
            return Ok(());
        }

        match fs::remove_dir_all(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(SandboxError::staging(
                    format!("failed to remove execution root {}", self.path.display()),
                    e,
                ));
            }
        }

        tracing::debug!(root = %self.path.display(), "execution root removed");
        self.torn_down = true;
        Ok(())
    }
}

impl Drop for ExecutionRoot {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!(error = %e, "execution root cleanup failed");
        }
    }
}

fn create_unique_dir(base: &Path) -> Result<PathBuf> {
    fs::create_dir_all(base).map_err(|e| {
        SandboxError::staging(format!("failed to create scratch dir {}", base.display()), e)
    })?;

    let pid = std::process::id();
    loop {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let candidate = base.join(format!("{pid}-{seq}"));
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                return Err(SandboxError::staging(
                    format!("failed to create execution root {}", candidate.display()),
                    e,
                ));
            }
        }
    }
}

/// `/usr/lib` -> `usr/lib`; `None` for `/` itself
fn relative_to_root(path: &Path) -> Option<PathBuf> {
    let rel = normalize(path.strip_prefix("/").unwrap_or(path));
    (!rel.as_os_str().is_empty()).then_some(rel)
}

/// Mirror one host system path into the root. Symlinks (merged-/usr layouts) are recreated
/// as symlinks, directories get a mount point. Returns false when the host lacks the path.
fn stage_system_path(base: &Path, host: &Path, target: &Path, plan: &mut MountPlan) -> Result<bool> {
    let Ok(meta) = fs::symlink_metadata(host) else {
        return Ok(false);
    };
    let dest = base.join(target);
    ensure_parent(&dest)?;

    if meta.file_type().is_symlink() {
        let link = fs::read_link(host)
            .map_err(|e| SandboxError::staging(format!("failed to read link {}", host.display()), e))?;
        std::os::unix::fs::symlink(&link, &dest).map_err(|e| {
            SandboxError::staging(format!("failed to create link {}", dest.display()), e)
        })?;
        return Ok(true);
    }

    create_mount_point(&dest, meta.is_dir())?;
    plan.binds.push(BindMount {
        source: resolve_source(host)?,
        target: target.to_path_buf(),
        kind: BindKind::ReadOnly,
    });
    Ok(true)
}

/// Bind sources are opened below the old root after the pivot, where absolute symlinks
/// would resolve against the new root; resolve them while the host view is still in place.
fn resolve_source(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path)
        .map_err(|e| SandboxError::staging(format!("cannot resolve {}", path.display()), e))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            SandboxError::staging(format!("failed to create {}", parent.display()), e)
        })?;
    }
    Ok(())
}

fn create_mount_point(path: &Path, dir: bool) -> Result<()> {
    ensure_parent(path)?;
    let created = if dir {
        fs::create_dir(path)
    } else {
        fs::File::create(path).map(drop)
    };
    created.map_err(|e| {
        SandboxError::staging(format!("failed to create mount point {}", path.display()), e)
    })
}

fn create_writable_dir(path: &Path, owner: Option<Identity>) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| SandboxError::staging(format!("failed to create {}", path.display()), e))?;
    if let Some(owner) = owner {
        std::os::unix::fs::chown(path, Some(owner.uid), Some(owner.gid)).map_err(|e| {
            SandboxError::staging(format!("failed to chown {}", path.display()), e)
        })?;
    }
    Ok(())
}

fn copy_input(source: &Path, dest: &Path, is_dir: bool) -> io::Result<()> {
    if is_dir {
        copy_tree(source, dest, true)
    } else {
        fs::copy(source, dest)?;
        set_read_only(dest)
    }
}

/// Recursive copy that recreates symlinks instead of following them
fn copy_tree(source: &Path, dest: &Path, read_only: bool) -> io::Result<()> {
    fs::create_dir(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(&from)?, &to)?;
        } else if file_type.is_dir() {
            copy_tree(&from, &to, read_only)?;
        } else {
            fs::copy(&from, &to)?;
            if read_only {
                set_read_only(&to)?;
            }
        }
    }
    Ok(())
}

fn set_read_only(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

fn move_entry(from: &Path, to: &Path) -> io::Result<()> {
    if let Ok(existing) = fs::symlink_metadata(to) {
        if existing.is_dir() {
            fs::remove_dir_all(to)?;
        } else {
            fs::remove_file(to)?;
        }
    }

    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            let file_type = fs::symlink_metadata(from)?.file_type();
            if file_type.is_symlink() {
                std::os::unix::fs::symlink(fs::read_link(from)?, to)?;
                fs::remove_file(from)
            } else if file_type.is_dir() {
                copy_tree(from, to, false)?;
                fs::remove_dir_all(from)
            } else {
                fs::copy(from, to)?;
                fs::remove_file(from)
            }
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        config: ExecutorConfig,
        src: PathBuf,
        host_root: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let host_root = tmp.path().join("work");
        fs::create_dir_all(src.join("lib")).unwrap();
        fs::create_dir_all(&host_root).unwrap();
        fs::write(src.join("a.txt"), b"alpha").unwrap();
        fs::write(src.join("lib/b.txt"), b"beta").unwrap();

        let config = ExecutorConfig::builder()
            .scratch_dir(tmp.path().join("scratch"))
            .build();
        Fixture {
            _tmp: tmp,
            config,
            src,
            host_root,
        }
    }

    fn spec(fx: &Fixture) -> SpawnSpec {
        SpawnSpec::builder()
            .args(["cp", "in/a.txt", "out/a.txt"])
            .host_root(&fx.host_root)
            .input("in/a.txt", fx.src.join("a.txt"))
            .input("deps", fx.src.join("lib"))
            .output("out")
            .scratch("tmp")
            .workdir("pkg")
            .build()
            .unwrap()
    }

    #[test]
    fn copy_mode_makes_inputs_readable_and_outputs_writable() {
        let fx = fixture();
        let root = ExecutionRootBuilder::new(&fx.config)
            .stage(&spec(&fx), StagingMode::Copy)
            .unwrap();

        assert_eq!(fs::read(root.path().join("in/a.txt")).unwrap(), b"alpha");
        assert_eq!(fs::read(root.path().join("deps/b.txt")).unwrap(), b"beta");
        assert!(
            fs::metadata(root.path().join("in/a.txt"))
                .unwrap()
                .permissions()
                .readonly()
        );

        fs::write(root.path().join("out/result.o"), b"obj").unwrap();
        fs::write(root.path().join("tmp/scratch"), b"x").unwrap();
        assert!(root.path().join("pkg").is_dir());
        assert!(!root.path().join(OLD_ROOT).exists());
    }

    #[test]
    fn bind_mode_creates_mount_points_and_plan() {
        let fx = fixture();
        let config = ExecutorConfig::builder()
            .scratch_dir(fx.config.scratch_dir.clone())
            .system_paths(["/bin", "/usr", "/definitely-not-here"])
            .build();
        let root = ExecutionRootBuilder::new(&config)
            .stage(&spec(&fx), StagingMode::Bind)
            .unwrap();

        let a = root.path().join("in/a.txt");
        assert!(fs::symlink_metadata(&a).unwrap().is_file());
        assert_eq!(fs::metadata(&a).unwrap().len(), 0);
        assert!(root.path().join("deps").is_dir());
        assert!(root.path().join(OLD_ROOT).is_dir());
        assert!(!root.path().join("definitely-not-here").exists());

        let plan = root.mount_plan();
        let source = fs::canonicalize(fx.src.join("a.txt")).unwrap();
        assert!(plan.binds.iter().any(|b| b.target == Path::new("in/a.txt")
            && b.source == source
            && b.kind == BindKind::ReadOnly));
        assert!(plan.binds.iter().any(|b| b.kind == BindKind::Device));
        assert_eq!(plan.writable, vec![PathBuf::from("out")]);
        assert_eq!(plan.tmpfs, vec![PathBuf::from("tmp")]);
    }

    #[test]
    fn missing_input_fails_and_leaves_nothing_behind() {
        let fx = fixture();
        let spec = SpawnSpec::builder()
            .arg("true")
            .host_root(&fx.host_root)
            .input("in/a.txt", fx.src.join("a.txt"))
            .input("in/gone.txt", fx.src.join("gone.txt"))
            .output("out")
            .build()
            .unwrap();

        let err = ExecutionRootBuilder::new(&fx.config)
            .stage(&spec, StagingMode::Copy)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StagingFailed);
        assert!(err.to_string().contains("gone.txt"), "{err}");
        assert!(err.to_string().contains("No such file or directory"), "{err}");
        assert_eq!(err.errno(), Some(nix::errno::Errno::ENOENT));

        let leftovers = fs::read_dir(&fx.config.scratch_dir).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn output_colliding_with_input_fails() {
        let fx = fixture();
        let mut spec = spec(&fx);
        spec.outputs.insert(PathBuf::from("deps/gen"));

        let err = ExecutionRootBuilder::new(&fx.config)
            .stage(&spec, StagingMode::Copy)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StagingFailed);
    }

    #[test]
    fn declared_paths_may_not_shadow_system_paths() {
        let fx = fixture();
        let config = ExecutorConfig::builder()
            .scratch_dir(fx.config.scratch_dir.clone())
            .system_paths(["/usr"])
            .build();
        let mut spec = spec(&fx);
        spec.outputs.insert(PathBuf::from("usr/local"));

        let err = ExecutionRootBuilder::new(&config)
            .stage(&spec, StagingMode::Bind)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StagingFailed);
    }

    #[test]
    fn concurrent_roots_are_distinct() {
        let fx = fixture();
        let spec = spec(&fx);
        let builder = ExecutionRootBuilder::new(&fx.config);
        let a = builder.stage(&spec, StagingMode::Copy).unwrap();
        let b = builder.stage(&spec, StagingMode::Copy).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn teardown_is_idempotent() {
        let fx = fixture();
        let mut root = ExecutionRootBuilder::new(&fx.config)
            .stage(&spec(&fx), StagingMode::Copy)
            .unwrap();
        let path = root.path().to_path_buf();

        root.teardown().unwrap();
        assert!(!path.exists());
        root.teardown().unwrap();
    }

    #[test]
    fn kept_root_survives_drop() {
        let fx = fixture();
        let mut root = ExecutionRootBuilder::new(&fx.config)
            .stage(&spec(&fx), StagingMode::Copy)
            .unwrap();
        let path = root.path().to_path_buf();
        root.keep();
        root.teardown().unwrap();
        drop(root);
        assert!(path.exists());
    }

    #[test]
    fn materialize_moves_outputs_and_replaces_existing_entries() {
        let fx = fixture();
        fs::create_dir_all(fx.host_root.join("out")).unwrap();
        fs::write(fx.host_root.join("out/a.txt"), b"stale").unwrap();

        let root = ExecutionRootBuilder::new(&fx.config)
            .stage(&spec(&fx), StagingMode::Copy)
            .unwrap();
        fs::write(root.path().join("out/a.txt"), b"fresh").unwrap();
        fs::create_dir(root.path().join("out/nested")).unwrap();
        fs::write(root.path().join("out/nested/c.txt"), b"c").unwrap();

        assert_eq!(root.materialize_outputs().unwrap(), 2);
        assert_eq!(fs::read(fx.host_root.join("out/a.txt")).unwrap(), b"fresh");
        assert_eq!(fs::read(fx.host_root.join("out/nested/c.txt")).unwrap(), b"c");
        assert!(!root.path().join("out/a.txt").exists());
    }
}
