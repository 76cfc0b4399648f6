//! Privileged operations behind an allow-list gate.
//!
//! The gate is an explicit wrapper applied where admin handlers are
//! registered: every `/admin` subcommand passes through `AdminGate::ensure`
//! before its handler body runs, and an unlisted caller gets the tagged
//! not-authorized error (with the caller id and the allow-list) rather
//! than a generic failure.

use std::sync::Arc;

use crate::error::CoreError;
use crate::roles::RoleRegistry;
use crate::scheduler::SchedulerService;

#[derive(Clone)]
pub struct AdminGate {
    admins: Vec<i64>,
}

impl AdminGate {
    pub fn new(admins: Vec<i64>) -> Self {
        Self { admins }
    }

    pub fn ensure(&self, user_id: i64) -> Result<(), CoreError> {
        if self.admins.contains(&user_id) {
            Ok(())
        } else {
            Err(CoreError::NotAuthorized {
                user_id,
                admins: self.admins.clone(),
            })
        }
    }
}

pub struct AdminService {
    gate: AdminGate,
    scheduler: Arc<SchedulerService>,
    roles: Arc<RoleRegistry>,
}

impl AdminService {
    pub fn new(gate: AdminGate, scheduler: Arc<SchedulerService>, roles: Arc<RoleRegistry>) -> Self {
        Self {
            gate,
            scheduler,
            roles,
        }
    }

    /// Handle a full "/admin ..." line. Always returns a string; the gate
    /// error renders the caller id and allow-list for auditability.
    pub async fn handle_command(&self, user_id: i64, message: &str) -> String {
        // Drop the leading "/admin" token; everything after it is the
        // subcommand line.
        let rest = match message.trim().split_once(char::is_whitespace) {
            Some((_marker, rest)) => rest.trim(),
            None => "",
        };
        let (sub, _args) = match rest.split_once(char::is_whitespace) {
            Some((sub, args)) => (sub, args.trim()),
            None => (rest, ""),
        };

        let result = match sub.to_lowercase().as_str() {
            "triggernews" => self.trigger_news_job(user_id).await,
            "reload" => self.reload_configs(user_id).await,
            _ => Ok("Unknown admin command. Available: triggernews, reload.".to_string()),
        };

        match result {
            Ok(reply) => reply,
            Err(e @ CoreError::NotAuthorized { .. }) => e.user_message(&[]),
            Err(e) => {
                tracing::error!("Admin command '{}' failed: {:#}", sub, e);
                format!("Admin command failed: {}", e.user_message(&[]))
            }
        }
    }

    async fn trigger_news_job(&self, user_id: i64) -> Result<String, CoreError> {
        self.gate.ensure(user_id)?;
        tracing::info!("Admin {} triggered the news job manually", user_id);
        match self.scheduler.run_report_job().await {
            Ok(status) => Ok(format!("Daily news job triggered: {}.", status)),
            Err(e) => {
                tracing::error!("Forced news job failed: {:#}", e);
                Ok("Daily news job failed; see server logs.".to_string())
            }
        }
    }

    async fn reload_configs(&self, user_id: i64) -> Result<String, CoreError> {
        self.gate.ensure(user_id)?;
        tracing::info!("Admin {} requested config reload", user_id);
        match self.roles.reload() {
            Ok(count) => Ok(format!("Roles configuration reloaded ({} roles).", count)),
            Err(e) => {
                tracing::error!("Roles reload failed: {:#}", e);
                Ok("Roles reload failed; the previous set stays in effect.".to_string())
            }
        }
    }
}
