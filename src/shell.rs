//! Command factory with layered defaults.
//!
//! A [`Shell`] carries a defaults configurator; every [`Shell::run`] call
//! builds a fresh [`Options`], applies the shell's configurator and then
//! the per-call one (per-call wins, like any override layer), and
//! materializes the command. Once a command exists, the captured option
//! values are never revisited.
//!
//! ```no_run
//! # async fn demo() -> shellpipe::Result<()> {
//! use std::time::Duration;
//! use shellpipe::Shell;
//!
//! let shell = Shell::with_options(|opts| {
//!     opts.throw_on_error(true).timeout(Duration::from_secs(30));
//! });
//! let result = shell.run("echo", ["hello"])?.wait().await?;
//! assert_eq!(result.stdout().await?, "hello\n");
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::command::{self, Command};
use crate::error::Result;
use crate::stdio::StreamEncoding;
use crate::syntax::ArgumentSyntax;

type StartMutator = Box<dyn FnMut(&mut tokio::process::Command) + Send>;
type CommandMutator = Box<dyn FnMut(&mut Command) + Send>;

/// Per-command settings, built fresh for every run.
///
/// Start-info mutators run against the launch configuration in the order
/// they were added; command mutators run against the built [`Command`]
/// before it is returned.
pub struct Options {
    pub(crate) start_mutators: Vec<StartMutator>,
    pub(crate) command_mutators: Vec<CommandMutator>,
    pub(crate) throw_on_error: bool,
    pub(crate) dispose_on_exit: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) encoding: StreamEncoding,
    pub(crate) cancellation: Option<CancellationToken>,
    pub(crate) syntax: ArgumentSyntax,
    encoding_overridden: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            start_mutators: Vec::new(),
            command_mutators: Vec::new(),
            throw_on_error: false,
            dispose_on_exit: true,
            timeout: None,
            encoding: StreamEncoding::default(),
            cancellation: None,
            syntax: ArgumentSyntax::default(),
            encoding_overridden: false,
        }
    }
}

impl Options {
    /// Initial working directory of the child.
    pub fn working_directory(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        let path = path.into();
        self.start_info(move |cmd| {
            cmd.current_dir(&path);
        })
    }

    /// Override one environment variable; everything else is inherited.
    pub fn environment_variable(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        let (key, value) = (key.into(), value.into());
        self.start_info(move |cmd| {
            cmd.env(&key, &value);
        })
    }

    /// Override several environment variables at once.
    pub fn environment_variables<I, K, V>(&mut self, vars: I) -> &mut Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: Vec<(String, String)> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.start_info(move |cmd| {
            cmd.envs(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        })
    }

    /// Arbitrary mutation of the launch configuration. Mutators run in
    /// the order they were added.
    pub fn start_info<F>(&mut self, mutate: F) -> &mut Self
    where
        F: FnMut(&mut tokio::process::Command) + Send + 'static,
    {
        self.start_mutators.push(Box::new(mutate));
        self
    }

    /// Mutation of the built [`Command`] before `run` returns it.
    pub fn command<F>(&mut self, mutate: F) -> &mut Self
    where
        F: FnMut(&mut Command) + Send + 'static,
    {
        self.command_mutators.push(Box::new(mutate));
        self
    }

    /// Make `wait()` fail with [`Error::ErrorExitCode`] on a non-zero
    /// exit (default false).
    ///
    /// [`Error::ErrorExitCode`]: crate::Error::ErrorExitCode
    pub fn throw_on_error(&mut self, enabled: bool) -> &mut Self {
        self.throw_on_error = enabled;
        self
    }

    /// Release the OS handle as soon as the process exits, killing the
    /// child if the handle is dropped while it still runs (default true).
    pub fn dispose_on_exit(&mut self, enabled: bool) -> &mut Self {
        self.dispose_on_exit = enabled;
        self
    }

    /// Kill the process after `timeout` and fail `wait()` with
    /// [`Error::Timeout`] (default: no limit).
    ///
    /// [`Error::Timeout`]: crate::Error::Timeout
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Text encoding for captured output (default: lossy UTF-8).
    pub fn encoding(&mut self, encoding: StreamEncoding) -> &mut Self {
        self.encoding = encoding;
        self.encoding_overridden = true;
        self
    }

    /// Kill the process when `token` fires and fail `wait()` with
    /// [`Error::Cancelled`].
    ///
    /// [`Error::Cancelled`]: crate::Error::Cancelled
    pub fn cancellation_token(&mut self, token: CancellationToken) -> &mut Self {
        self.cancellation = Some(token);
        self
    }

    /// Argument joining rules (default: platform native).
    pub fn syntax(&mut self, syntax: ArgumentSyntax) -> &mut Self {
        self.syntax = syntax;
        self
    }

    /// Whether any setting was configured that only applies at spawn time
    /// (rejected by `try_attach`).
    pub(crate) fn spawn_only_configured(&self) -> bool {
        self.encoding_overridden || !self.start_mutators.is_empty()
    }
}

/// Factory for [`Command`]s, carrying default options.
#[derive(Clone, Default)]
pub struct Shell {
    configure: Option<Arc<dyn Fn(&mut Options) + Send + Sync>>,
}

impl Shell {
    /// A shell with stock defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A shell whose configurator runs against every command's options.
    #[must_use]
    pub fn with_options<F>(configure: F) -> Self
    where
        F: Fn(&mut Options) + Send + Sync + 'static,
    {
        Self {
            configure: Some(Arc::new(configure)),
        }
    }

    /// Launch `program` with `args` under this shell's defaults.
    pub fn run<I, S>(&self, program: impl AsRef<str>, args: I) -> Result<Command>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.run_with(program, args, |_| {})
    }

    /// Launch with per-call option overrides applied after the shell's
    /// defaults.
    pub fn run_with<I, S, F>(&self, program: impl AsRef<str>, args: I, configure: F) -> Result<Command>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: FnOnce(&mut Options),
    {
        let mut options = self.options(configure);
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let mut built = command::spawn(program.as_ref(), &args, &mut options)?;
        for mutate in &mut options.command_mutators {
            mutate(&mut built);
        }
        Ok(built)
    }

    /// Attach to an already-running process. `Ok(None)` when the pid is
    /// invalid or the process already exited.
    ///
    /// Encoding and start-info options cannot apply to a process this
    /// library did not start; combining them with attach fails with
    /// [`Error::InvalidAttachOptions`].
    ///
    /// [`Error::InvalidAttachOptions`]: crate::Error::InvalidAttachOptions
    pub fn try_attach(&self, pid: u32) -> Result<Option<Command>> {
        self.try_attach_with(pid, |_| {})
    }

    /// Attach with per-call option overrides.
    pub fn try_attach_with<F>(&self, pid: u32, configure: F) -> Result<Option<Command>>
    where
        F: FnOnce(&mut Options),
    {
        let mut options = self.options(configure);
        let attached = command::try_attach(pid, &options)?;
        match attached {
            Some(mut built) => {
                for mutate in &mut options.command_mutators {
                    mutate(&mut built);
                }
                Ok(Some(built))
            }
            None => Ok(None),
        }
    }

    fn options<F: FnOnce(&mut Options)>(&self, configure: F) -> Options {
        let mut options = Options::default();
        if let Some(defaults) = &self.configure {
            defaults(&mut options);
        }
        configure(&mut options);
        options
    }
}
