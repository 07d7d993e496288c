use std::process;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _};
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::time::sleep;

pub trait OutputExt {
    // Fail unless the process exited cleanly with code 0.
    fn ok(&self) -> anyhow::Result<()>;
    // Return the exit code, failing only if the process was killed by a
    // signal. Useful when a nonzero code is something you want to inspect
    // rather than treat as an error.
    fn code_not_killed(&self) -> anyhow::Result<i32>;
}

impl OutputExt for process::Output {
    fn ok(&self) -> anyhow::Result<()> {
        let code = self.code_not_killed()?;
        if code != 0 {
            bail!(
                "process failed with exit code {}. stderr:\n{}\nstdout:\n{}",
                code,
                String::from_utf8_lossy(&self.stderr),
                String::from_utf8_lossy(&self.stdout)
            );
        }
        Ok(())
    }

    fn code_not_killed(&self) -> anyhow::Result<i32> {
        self.status
            .code()
            .ok_or_else(|| anyhow!("process terminated by signal {:?}", self.status))
    }
}

pub trait CommandExt {
    // Run the command to completion, capturing output, and fail unless it
    // exited with code 0. The error includes stderr, which is almost always
    // what you want when shelling out to git.
    async fn execute(&mut self) -> anyhow::Result<process::Output>;
}

impl CommandExt for Command {
    async fn execute(&mut self) -> anyhow::Result<process::Output> {
        let output = self
            .output()
            .await
            .with_context(|| format!("failed to start {:?}", self))?;
        output.ok().with_context(|| format!("running {:?}", self))?;
        Ok(output)
    }
}

// Terminate the process group led by pid: SIGTERM first, and if the group
// leader is still around after the grace period, SIGKILL the group. Children
// spawned with process_group(0) lead their own group, so this takes out any
// shells or helpers the developer CLI forked along the way instead of leaving
// zombies holding the workspace.
//
// ESRCH just means everything already died, which is the happy case.
pub async fn terminate_group(pid: u32, grace: Duration) {
    let pgid = Pid::from_raw(pid as i32);
    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) => debug!("sent SIGTERM to process group {}", pid),
        Err(nix::errno::Errno::ESRCH) => return,
        Err(e) => {
            warn!("SIGTERM of process group {} failed: {}", pid, e);
            return;
        }
    }
    sleep(grace).await;
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => info!(
            "process group {} survived SIGTERM for {:?}, sent SIGKILL",
            pid, grace
        ),
        Err(nix::errno::Errno::ESRCH) => (),
        Err(e) => warn!("SIGKILL of process group {} failed: {}", pid, e),
    }
}
