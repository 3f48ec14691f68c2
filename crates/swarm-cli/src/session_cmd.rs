//! Interactive session commands: exec, attach, run.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;

use anyhow::Context;
use clap::Args;
use swarm_relay::{FrameBuffer, SessionTarget, StreamKind, stream::READ_CHUNK};
use tracing::{debug, warn};

use crate::engine::{ContainerConfig, EngineClient, ExecConfig};

/// Arguments of `swarm exec`.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Keep stdin open
    #[arg(short, long)]
    pub interactive: bool,
    /// Allocate a pseudo-TTY
    #[arg(short, long)]
    pub tty: bool,
    /// Start the command and return immediately
    #[arg(short, long, conflicts_with_all = ["interactive", "tty"])]
    pub detach: bool,
    /// Run the command as this user
    #[arg(short, long)]
    pub user: Option<String>,
    /// Target container
    pub container: String,
    /// Command and its arguments
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Arguments of `swarm attach`.
#[derive(Args, Debug)]
pub struct AttachArgs {
    /// Replay the container's earlier output first
    #[arg(long)]
    pub logs: bool,
    /// Container to attach to
    pub container: String,
}

/// Arguments of `swarm run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Keep stdin open
    #[arg(short, long)]
    pub interactive: bool,
    /// Allocate a pseudo-TTY
    #[arg(short, long)]
    pub tty: bool,
    /// Remove the container when the session ends
    #[arg(long, requires_all = ["interactive", "tty"])]
    pub rm: bool,
    /// Container name
    #[arg(long)]
    pub name: Option<String>,
    /// Image to create the container from
    pub image: String,
    /// Command and its arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Relay this process's terminal to `target`.
///
/// The relay works on duplicates of the stdin/stdout descriptors so that no
/// std-level buffering sits between the terminal and the readiness loop.
pub fn relay_terminal(client: &EngineClient, target: &SessionTarget) -> anyhow::Result<()> {
    io::stdout().flush()?;
    let input = File::from(io::stdin().as_fd().try_clone_to_owned()?);
    let output = File::from(io::stdout().as_fd().try_clone_to_owned()?);
    swarm_relay::relay(client, target, input, output)
        .with_context(|| format!("Relay to {target} failed"))
}

/// `swarm exec`.
pub fn exec(client: &EngineClient, args: ExecArgs) -> anyhow::Result<()> {
    let interactive = args.interactive && args.tty;
    let config = ExecConfig {
        attach_stdin: interactive,
        attach_stdout: true,
        attach_stderr: true,
        tty: interactive,
        cmd: args.command,
        user: args.user,
    };
    let id = client
        .create_exec(&args.container, &config)
        .with_context(|| format!("Failed to create exec in {}", args.container))?;
    debug!(exec = %id, container = %args.container, interactive, "Created exec instance");

    if interactive {
        return relay_terminal(client, &SessionTarget::Exec(id));
    }
    if args.detach {
        client.start_exec_detached(&id)?;
        writeln!(io::stdout(), "{id}")?;
        return Ok(());
    }
    let output = client.exec_output(&id)?;
    copy_frames(output, &mut io::stdout().lock(), &mut io::stderr().lock())
}

/// `swarm attach`.
pub fn attach(client: &EngineClient, args: &AttachArgs) -> anyhow::Result<()> {
    let client = client.clone().with_attach_logs(args.logs);
    relay_terminal(&client, &SessionTarget::Container(args.container.clone()))
}

/// `swarm run`.
pub fn run(client: &EngineClient, args: RunArgs) -> anyhow::Result<()> {
    let interactive = args.interactive && args.tty;
    let config = ContainerConfig {
        image: args.image.clone(),
        cmd: args.command,
        tty: args.tty,
        open_stdin: args.interactive,
        stdin_once: args.interactive,
        attach_stdin: args.interactive,
        attach_stdout: true,
        attach_stderr: true,
    };
    let created = client
        .create_container(&config, args.name.as_deref())
        .with_context(|| format!("Failed to create container from {}", args.image))?;
    for warning in created.warnings.iter().flatten() {
        writeln!(io::stderr(), "[Warning] {warning}")?;
    }
    let id = created.id;

    client.start_container(&id)?;
    if !interactive {
        writeln!(io::stdout(), "{id}")?;
        return Ok(());
    }

    let client = client.clone().with_attach_logs(true);
    let relayed = relay_terminal(&client, &SessionTarget::Container(id.clone()));
    if args.rm {
        remove_after_exit(&client, &id);
    }
    relayed
}

fn remove_after_exit(client: &EngineClient, id: &str) {
    match client.wait_container(id) {
        Ok(code) => debug!(container = %id, code, "Container exited"),
        Err(e) => warn!(container = %id, error = %e, "Failed to wait for container"),
    }
    if let Err(e) = client.remove_container(id, false, false) {
        warn!(container = %id, error = %e, "Failed to remove container");
    }
}

/// Decode a multiplexed output stream, sending stderr-tagged payloads to
/// `err` and everything else to `out`.
pub fn copy_frames<R, O, E>(mut reader: R, out: &mut O, err: &mut E) -> anyhow::Result<()>
where
    R: Read,
    O: Write,
    E: Write,
{
    let mut frames = FrameBuffer::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("Failed to read exec output"),
        };
        if n == 0 {
            break;
        }
        frames.extend(&buf[..n]);
        while let Some(frame) = frames.next_frame()? {
            match frame.kind {
                StreamKind::Stderr => err.write_all(&frame.payload)?,
                StreamKind::Stdout | StreamKind::Stdin => out.write_all(&frame.payload)?,
            }
        }
        out.flush()?;
        err.flush()?;
    }
    if frames.buffered_len() > 0 {
        warn!(buffered = frames.buffered_len(), "Exec output ended inside a frame");
    }
    Ok(())
}
