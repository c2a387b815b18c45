//! Named pipes shared between the bridge and the harness, and the
//! environment variables that name them.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tempfile::TempDir;
use tracing::debug;

/// Pipe the driven system writes state into (bridge -> harness).
pub const INPUT_PIPE_ENV: &str = "STS_GAME_INPUT_PIPE";
/// Pipe the harness writes commands into (harness -> bridge).
pub const OUTPUT_PIPE_ENV: &str = "STS_GAME_OUTPUT_PIPE";

const GAME_TO_TEST: &str = "game_to_test";
const TEST_TO_GAME: &str = "test_to_game";

/// The two pipe paths, named from the harness's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipePaths {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl PipePaths {
    /// Read both paths from the process environment. A missing variable is a
    /// configuration error and is never retried.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| -> Result<PathBuf> {
            match lookup(name) {
                Some(value) if !value.trim().is_empty() => Ok(PathBuf::from(value)),
                _ => bail!("environment variable {name} is not set"),
            }
        };
        Ok(Self {
            input: read(INPUT_PIPE_ENV)?,
            output: read(OUTPUT_PIPE_ENV)?,
        })
    }

    /// `(name, value)` pairs to hand to a child process.
    pub fn env_pairs(&self) -> [(&'static str, &Path); 2] {
        [
            (INPUT_PIPE_ENV, self.input.as_path()),
            (OUTPUT_PIPE_ENV, self.output.as_path()),
        ]
    }
}

/// A temporary directory holding both FIFOs. Removed on drop.
#[derive(Debug)]
pub struct PipeDir {
    dir: TempDir,
    paths: PipePaths,
}

impl PipeDir {
    /// Create the directory (under `parent`, or the system temp dir) and both FIFOs.
    pub fn create(parent: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("model-harness-");
        let dir = match parent {
            Some(parent) => builder
                .tempdir_in(parent)
                .with_context(|| format!("create pipe dir in {}", parent.display()))?,
            None => builder.tempdir().context("create pipe dir")?,
        };
        let paths = PipePaths {
            input: dir.path().join(GAME_TO_TEST),
            output: dir.path().join(TEST_TO_GAME),
        };
        make_fifo(&paths.input)?;
        make_fifo(&paths.output)?;
        debug!(dir = %dir.path().display(), "created pipes");
        Ok(Self { dir, paths })
    }

    pub fn paths(&self) -> &PipePaths {
        &self.paths
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

#[cfg(unix)]
fn make_fifo(path: &Path) -> Result<()> {
    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;

    mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)
        .with_context(|| format!("mkfifo {}", path.display()))
}

#[cfg(not(unix))]
fn make_fifo(path: &Path) -> Result<()> {
    bail!("named pipes are not supported on this platform ({})", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variable_is_fatal() {
        let err = PipePaths::from_lookup(|name| {
            (name == INPUT_PIPE_ENV).then(|| "/tmp/in".to_string())
        })
        .expect_err("output missing");
        assert!(err.to_string().contains(OUTPUT_PIPE_ENV), "{err}");

        let err = PipePaths::from_lookup(|_| Some("  ".to_string())).expect_err("blank");
        assert!(err.to_string().contains(INPUT_PIPE_ENV), "{err}");
    }

    #[test]
    fn reads_both_paths() {
        let paths = PipePaths::from_lookup(|name| match name {
            INPUT_PIPE_ENV => Some("/tmp/a".to_string()),
            OUTPUT_PIPE_ENV => Some("/tmp/b".to_string()),
            _ => None,
        })
        .expect("paths");
        assert_eq!(paths.input, PathBuf::from("/tmp/a"));
        assert_eq!(paths.output, PathBuf::from("/tmp/b"));
    }

    #[cfg(unix)]
    #[test]
    fn creates_fifos_and_removes_them_on_drop() {
        use std::os::unix::fs::FileTypeExt;

        let parent = tempfile::tempdir().expect("tempdir");
        let pipes = PipeDir::create(Some(parent.path())).expect("create");
        for path in [&pipes.paths().input, &pipes.paths().output] {
            let meta = std::fs::metadata(path).expect("metadata");
            assert!(meta.file_type().is_fifo(), "{}", path.display());
        }
        let dir = pipes.path().to_path_buf();
        drop(pipes);
        assert!(!dir.exists());
    }
}
