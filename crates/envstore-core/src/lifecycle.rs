//! Environment state machine.
//!
//! Legal transitions are the rows of [`TRANSITIONS`]; anything else is a
//! conflict. Running an action writes the new status on the environment row
//! and then runs the action's hooks, all inside the caller's transaction.

use crate::CoreError;
use envstore_store::{BuildUpdate, EnvStatus, Environment, EnvironmentUpdate, Transaction};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};
use EnvStatus::{
    AwaitingApproval, AwaitingResolution, Done, Errored, InProgress, Initializing, Syncing,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Apply,
    Destroy,
    Import,
    Sync,
    Submission,
    SubmissionAccepted,
    SubmissionRejected,
    SyncAccepted,
    SyncIgnored,
    SyncRejected,
}

impl Action {
    pub const ALL: [Action; 10] = [
        Action::Apply,
        Action::Destroy,
        Action::Import,
        Action::Sync,
        Action::Submission,
        Action::SubmissionAccepted,
        Action::SubmissionRejected,
        Action::SyncAccepted,
        Action::SyncIgnored,
        Action::SyncRejected,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Apply => "apply",
            Action::Destroy => "destroy",
            Action::Import => "import",
            Action::Sync => "sync",
            Action::Submission => "submission",
            Action::SubmissionAccepted => "submission-accepted",
            Action::SubmissionRejected => "submission-rejected",
            Action::SyncAccepted => "sync-accepted",
            Action::SyncIgnored => "sync-ignored",
            Action::SyncRejected => "sync-rejected",
        }
    }

    fn hooks(self) -> &'static [Hook] {
        match self {
            Action::SyncAccepted
            | Action::SyncIgnored
            | Action::SyncRejected
            | Action::SubmissionRejected => &[Hook::LatestBuildDone],
            Action::SubmissionAccepted => &[Hook::LatestBuildFollowsEnvironment],
            Action::Apply | Action::Destroy | Action::Import | Action::Sync | Action::Submission => {
                &[]
            }
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| CoreError::BadRequest(format!("unknown action '{s}'")))
    }
}

/// Side effects that run after the environment status is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    /// Mark the environment's most recent build `done`.
    LatestBuildDone,
    /// Copy the environment's new status onto its most recent build.
    LatestBuildFollowsEnvironment,
}

/// `(action, from, to)`.
pub const TRANSITIONS: &[(Action, EnvStatus, EnvStatus)] = &[
    (Action::Apply, Initializing, InProgress),
    (Action::Apply, Done, InProgress),
    (Action::Apply, Errored, InProgress),
    (Action::Destroy, Initializing, InProgress),
    (Action::Destroy, Done, InProgress),
    (Action::Destroy, Errored, InProgress),
    (Action::Import, Initializing, InProgress),
    (Action::Import, Done, InProgress),
    (Action::Import, Errored, InProgress),
    (Action::Sync, Initializing, Syncing),
    (Action::Sync, Done, Syncing),
    (Action::Sync, Errored, Syncing),
    (Action::Submission, Initializing, AwaitingApproval),
    (Action::Submission, Done, AwaitingApproval),
    (Action::Submission, Errored, AwaitingApproval),
    (Action::SubmissionAccepted, AwaitingApproval, InProgress),
    (Action::SubmissionRejected, AwaitingApproval, Done),
    (Action::SyncAccepted, AwaitingResolution, Done),
    (Action::SyncIgnored, AwaitingResolution, Done),
    (Action::SyncRejected, AwaitingResolution, InProgress),
];

/// Status an environment moves to when `action` is taken from `from`.
pub fn next_status(action: Action, from: EnvStatus) -> Result<EnvStatus, CoreError> {
    TRANSITIONS
        .iter()
        .find(|(a, f, _)| *a == action && *f == from)
        .map(|(_, _, to)| *to)
        .ok_or_else(|| rejection(action, from))
}

fn rejection(action: Action, from: EnvStatus) -> CoreError {
    match from {
        InProgress => {
            CoreError::Conflict("could not create environment build: build in progress".to_owned())
        }
        Syncing => CoreError::Conflict(
            "could not create environment build: environment is syncing".to_owned(),
        ),
        other => CoreError::Conflict(format!(
            "could not {action} environment: environment is {other}"
        )),
    }
}

/// Take `action` on an environment whose row `tx` already holds locked.
///
/// A rejected action writes nothing.
pub async fn run<T: Transaction>(
    tx: &mut T,
    env: &Environment,
    action: Action,
) -> Result<EnvStatus, CoreError> {
    let next = next_status(action, env.status)?;
    tx.update_environment(env.id, &EnvironmentUpdate::status(next))
        .await?;

    for hook in action.hooks() {
        let status = match hook {
            Hook::LatestBuildDone => Done,
            Hook::LatestBuildFollowsEnvironment => next,
        };
        if let Some(build) = tx.latest_build(env.id).await? {
            tx.lock_build(&build.uuid).await?;
            tx.update_build(build.id, &BuildUpdate::status(status))
                .await?;
            debug!("{action}: build {} -> {status}", build.uuid);
        }
    }

    info!("environment {} {action}: {} -> {next}", env.name, env.status);
    Ok(next)
}
