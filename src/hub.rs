//! The chat hub: session registry, command dispatch, and free-text routing.
//!
//! One std mutex guards the session store and the live-service cache
//! together, so a session mutation and its cache invalidation are observed
//! atomically. The mutex is never held across an await: model calls,
//! retrieval, and factory construction all run unlocked. Construction is
//! single-flight per session; a per-session async mutex admits one
//! builder while the double-checked re-read catches everyone else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::admin::AdminService;
use crate::chat::{ChatService, ChatServiceFactory, ConfigSink};
use crate::commands::{self, Command};
use crate::error::CoreError;
use crate::llm::ModelBinding;
use crate::roles::RoleRegistry;
use crate::session::{SessionInfo, SessionStore};

pub type BindingResolver =
    Arc<dyn Fn(&str) -> Result<Arc<dyn ModelBinding>, CoreError> + Send + Sync>;

pub const ROLEPLAY_MODE: &str = crate::chat::roleplay::ROLEPLAY_MODE;

struct HubState {
    store: SessionStore,
    services: HashMap<String, Arc<dyn ChatService>>,
}

struct HubInner {
    state: Mutex<HubState>,
    build_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    factories: HashMap<String, Arc<dyn ChatServiceFactory>>,
    modes: Vec<String>,
    roles: Arc<RoleRegistry>,
    admin: Arc<AdminService>,
    default_binding: Arc<dyn ModelBinding>,
    resolve_binding: BindingResolver,
    reply_timeout: Duration,
}

#[derive(Clone)]
pub struct ChatHub {
    inner: Arc<HubInner>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RoleKind {
    User,
    Bot,
}

impl ChatHub {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: SessionStore,
        factories: Vec<Arc<dyn ChatServiceFactory>>,
        roles: Arc<RoleRegistry>,
        admin: Arc<AdminService>,
        default_binding: Arc<dyn ModelBinding>,
        resolve_binding: BindingResolver,
        reply_timeout: Duration,
    ) -> Self {
        let factories: HashMap<String, Arc<dyn ChatServiceFactory>> = factories
            .into_iter()
            .map(|f| (f.mode().to_string(), f))
            .collect();
        let mut modes: Vec<String> = factories.keys().cloned().collect();
        modes.sort();

        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(HubState {
                    store,
                    services: HashMap::new(),
                }),
                build_locks: Mutex::new(HashMap::new()),
                factories,
                modes,
                roles,
                admin,
                default_binding,
                resolve_binding,
                reply_timeout,
            }),
        }
    }

    pub fn modes(&self) -> &[String] {
        &self.inner.modes
    }

    /// The single inbound entry point. Always returns a reply string; no
    /// internal error ever escapes unformatted.
    pub async fn handle_message(&self, user_id: i64, raw: &str) -> String {
        let text = raw.trim();

        if let Some(rest) = text.strip_prefix('/') {
            let token = rest.split_whitespace().next().unwrap_or("");
            if token.eq_ignore_ascii_case("admin") {
                return self.inner.admin.handle_command(user_id, text).await;
            }
            return self.handle_command(user_id, rest).await;
        }

        self.handle_free_text(user_id, text).await
    }

    async fn handle_command(&self, user_id: i64, rest: &str) -> String {
        let Some((command, args)) = commands::parse(rest) else {
            let token = rest.split_whitespace().next().unwrap_or("");
            return commands::unknown_command_hint(token);
        };

        let result = match command {
            Command::NewSession => self.cmd_new(user_id, args).await,
            Command::ListSessions => self.cmd_list(user_id),
            Command::SwitchSession => self.cmd_switch(user_id, args),
            Command::DeleteSession => self.cmd_delete(user_id, args),
            Command::SwitchBotRole => self.cmd_switch_role(user_id, RoleKind::Bot, args),
            Command::SwitchUserRole => self.cmd_switch_role(user_id, RoleKind::User, args),
            Command::SwitchModel => self.cmd_switch_model(user_id, args).await,
            Command::Help => Ok(commands::render_help()),
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                if !matches!(e, CoreError::Validation(_) | CoreError::NoActiveSession) {
                    tracing::error!("Command /{} failed for user {}: {}", rest, user_id, e);
                }
                e.user_message(&self.inner.modes)
            }
        }
    }

    async fn handle_free_text(&self, user_id: i64, text: &str) -> String {
        let chat = match self.resolve_active_chat(user_id).await {
            Ok(Some(chat)) => chat,
            Ok(None) => return CoreError::NoActiveSession.user_message(&self.inner.modes),
            Err(e) => return e.user_message(&self.inner.modes),
        };

        match tokio::time::timeout(self.inner.reply_timeout, chat.produce_reply(text)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                tracing::error!("Reply failed for user {}: {}", user_id, e);
                e.user_message(&self.inner.modes)
            }
            Err(_) => {
                tracing::warn!("Reply timed out for user {}", user_id);
                CoreError::Timeout.user_message(&self.inner.modes)
            }
        }
    }

    /// Resolve the live chat service for the user's active session,
    /// constructing it on first access. `Ok(None)` means "no active
    /// session"; construction problems surface as `ServiceUnavailable`
    /// with the detail logged server-side.
    pub async fn resolve_active_chat(
        &self,
        user_id: i64,
    ) -> Result<Option<Arc<dyn ChatService>>, CoreError> {
        loop {
            // Fast path + snapshot under the exclusion domain.
            let info = {
                let mut guard = self.inner.state.lock().unwrap();
                let st = &mut *guard;
                let profile = st.store.get_or_create(user_id);
                let Some(active_id) = profile.active_session_id.clone() else {
                    return Ok(None);
                };
                let Some(info) = profile.sessions.get(&active_id).cloned() else {
                    tracing::error!(
                        "Active session {} missing from user {}'s map",
                        active_id,
                        user_id
                    );
                    return Ok(None);
                };
                if let Some(service) = st.services.get(&active_id) {
                    return Ok(Some(service.clone()));
                }
                info
            };

            // Single-flight: one builder per session.
            let build_lock = {
                let mut locks = self.inner.build_locks.lock().unwrap();
                locks
                    .entry(info.session_id.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                    .clone()
            };
            let _build_guard = build_lock.lock().await;

            // Double-check: the race winner may have inserted already.
            {
                let guard = self.inner.state.lock().unwrap();
                if let Some(service) = guard.services.get(&info.session_id) {
                    return Ok(Some(service.clone()));
                }
            }

            let Some(factory) = self.inner.factories.get(&info.mode) else {
                tracing::error!("No factory registered for session mode '{}'", info.mode);
                return Err(CoreError::ServiceUnavailable);
            };

            // Slow path, unlocked: construction may hit the retrieval corpus.
            let service = match factory
                .create(&info, self.inner.default_binding.clone(), self.config_sink())
                .await
            {
                Ok(service) => service,
                Err(e) => {
                    tracing::error!(
                        "Factory failed to create service for session {}: {}",
                        info.session_id,
                        e
                    );
                    return Err(CoreError::ServiceUnavailable);
                }
            };

            // Finalize under the lock. If the session was mutated while we
            // were building (role switch, config change), the freshly built
            // service is stale; drop it and go around again.
            {
                let mut guard = self.inner.state.lock().unwrap();
                let st = &mut *guard;
                let current = st
                    .store
                    .get(user_id)
                    .and_then(|p| p.sessions.get(&info.session_id));
                match current {
                    Some(current) if *current == info => {
                        st.services.insert(info.session_id.clone(), service.clone());
                        return Ok(Some(service));
                    }
                    _ => {
                        tracing::debug!(
                            "Session {} changed during construction; rebuilding",
                            info.session_id
                        );
                    }
                }
            }
        }
    }

    /// Evict the cached service for a session. Idempotent.
    pub fn invalidate(&self, session_id: &str) {
        let mut guard = self.inner.state.lock().unwrap();
        if guard.services.remove(session_id).is_some() {
            tracing::info!("Invalidated cached chat service for session {}", session_id);
        }
    }

    // ─── Command handlers ─────────────────────────────────────────────────

    async fn cmd_new(&self, user_id: i64, args: &str) -> Result<String, CoreError> {
        let (mode, rest) = match args.split_once(char::is_whitespace) {
            Some((mode, rest)) => (mode.trim(), rest.trim()),
            None => (args.trim(), ""),
        };
        if mode.is_empty() {
            return Err(CoreError::Validation(format!(
                "Usage: /new <mode> [args...]\nAvailable modes: {}",
                self.inner.modes.join(", ")
            )));
        }
        if !self.inner.factories.contains_key(mode) {
            return Err(CoreError::Validation(format!(
                "Unknown mode '{}'.\nAvailable modes: {}",
                mode,
                self.inner.modes.join(", ")
            )));
        }

        let mut session = SessionInfo::new(mode);
        if mode == ROLEPLAY_MODE {
            let mut parts = rest.split_whitespace();
            let (Some(user_role), Some(bot_role)) = (parts.next(), parts.next()) else {
                return Err(CoreError::Validation(
                    "Usage: /new roleplay <your role> <bot role>".to_string(),
                ));
            };
            self.inner.roles.validate(bot_role)?;
            session.user_role = Some(user_role.to_string());
            session.bot_role = Some(bot_role.to_string());
        } else if !rest.is_empty() {
            // Plain mode takes an optional system prompt as the rest of
            // the line.
            session.config.insert(
                "system_prompt".to_string(),
                serde_json::Value::String(rest.to_string()),
            );
        }

        let display_id = session.display_id().to_string();
        {
            let mut guard = self.inner.state.lock().unwrap();
            let st = &mut *guard;
            let old_active = {
                let profile = st.store.get_or_create(user_id);
                profile
                    .sessions
                    .insert(session.session_id.clone(), session.clone());
                profile.active_session_id.replace(session.session_id.clone())
            };
            if let Some(old) = old_active {
                st.services.remove(&old);
            }
            persist(&st.store);
        }

        Ok(format!(
            "New session created in '{}' mode. Id: {}",
            mode, display_id
        ))
    }

    fn cmd_list(&self, user_id: i64) -> Result<String, CoreError> {
        let mut guard = self.inner.state.lock().unwrap();
        let profile = guard.store.get_or_create(user_id);
        if profile.sessions.is_empty() {
            return Ok("You have no sessions yet. Use /new <mode> to start one.".to_string());
        }

        let active = profile.active_session_id.clone();
        let mut sessions: Vec<&SessionInfo> = profile.sessions.values().collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        let mut lines = vec!["[Your sessions]".to_string()];
        for session in sessions {
            let marker = if Some(&session.session_id) == active.as_ref() {
                "-> "
            } else {
                "   "
            };
            let details = if session.mode == ROLEPLAY_MODE {
                format!(
                    "{} <-> {}, mode: {}",
                    session.bot_role.as_deref().unwrap_or("?"),
                    session.user_role.as_deref().unwrap_or("?"),
                    session.mode
                )
            } else {
                format!("mode: {}", session.mode)
            };
            lines.push(format!(
                "{}id: {} ({})",
                marker,
                session.display_id(),
                details
            ));
        }
        Ok(lines.join("\n"))
    }

    fn cmd_switch(&self, user_id: i64, args: &str) -> Result<String, CoreError> {
        let mut guard = self.inner.state.lock().unwrap();
        let st = &mut *guard;
        let (target_id, old_active) = {
            let profile = st.store.get_or_create(user_id);
            let target_id = profile.resolve_prefix(args)?.session_id.clone();
            let old = profile.active_session_id.replace(target_id.clone());
            (target_id, old)
        };
        if let Some(old) = old_active {
            st.services.remove(&old);
        }
        persist(&st.store);

        Ok(format!(
            "Switched to session {}.",
            &target_id[..target_id.len().min(8)]
        ))
    }

    fn cmd_delete(&self, user_id: i64, args: &str) -> Result<String, CoreError> {
        let target_id;
        {
            let mut guard = self.inner.state.lock().unwrap();
            let st = &mut *guard;
            target_id = {
                let profile = st.store.get_or_create(user_id);
                let id = profile.resolve_prefix(args)?.session_id.clone();
                profile.sessions.remove(&id);
                if profile.active_session_id.as_deref() == Some(&id) {
                    // Any remaining session will do; clear when none remain.
                    profile.active_session_id = profile.sessions.keys().next().cloned();
                }
                id
            };
            st.services.remove(&target_id);
            persist(&st.store);
        }
        self.inner.build_locks.lock().unwrap().remove(&target_id);

        Ok(format!(
            "Deleted session {}.",
            &target_id[..target_id.len().min(8)]
        ))
    }

    fn cmd_switch_role(
        &self,
        user_id: i64,
        kind: RoleKind,
        args: &str,
    ) -> Result<String, CoreError> {
        let role_name = args.trim();
        if role_name.is_empty() {
            return Err(CoreError::Validation(
                "Please provide a role name.".to_string(),
            ));
        }

        let mut guard = self.inner.state.lock().unwrap();
        let st = &mut *guard;
        let (session_id, summary) = {
            let profile = st.store.get_or_create(user_id);
            let Some(active_id) = profile.active_session_id.clone() else {
                return Err(CoreError::NoActiveSession);
            };
            let Some(session) = profile.sessions.get_mut(&active_id) else {
                return Err(CoreError::NoActiveSession);
            };
            if session.mode != ROLEPLAY_MODE {
                return Err(CoreError::Validation(format!(
                    "This command is only available in '{}' sessions.",
                    ROLEPLAY_MODE
                )));
            }

            // Validate before mutating; an unknown bot role leaves the
            // session untouched.
            match kind {
                RoleKind::Bot => {
                    self.inner.roles.validate(role_name)?;
                    session.bot_role = Some(role_name.to_string());
                }
                RoleKind::User => {
                    session.user_role = Some(role_name.to_string());
                }
            }

            let summary = format!(
                "Roles updated. Now: {} <-> {}",
                session.user_role.as_deref().unwrap_or("?"),
                session.bot_role.as_deref().unwrap_or("?")
            );
            (active_id, summary)
        };

        // The cached service still runs the old persona; evict it so the
        // next message rebuilds with fresh parameters.
        st.services.remove(&session_id);
        persist(&st.store);

        Ok(summary)
    }

    async fn cmd_switch_model(&self, user_id: i64, args: &str) -> Result<String, CoreError> {
        let name = args.trim();
        if name.is_empty() {
            return Err(CoreError::Validation(
                "Please provide a model name.".to_string(),
            ));
        }

        let Some(chat) = self.resolve_active_chat(user_id).await? else {
            return Err(CoreError::NoActiveSession);
        };

        let binding = (self.inner.resolve_binding)(name)?;
        chat.replace_binding(binding);

        Ok(format!(
            "Model for the current session switched to {}.",
            name
        ))
    }

    /// The write-back used by services to patch their own session config.
    /// Holds a weak reference: services live inside the hub's cache, and a
    /// strong cycle would never drop.
    fn config_sink(&self) -> ConfigSink {
        let weak: Weak<HubInner> = Arc::downgrade(&self.inner);
        Arc::new(move |session_id: &str, patch| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut guard = inner.state.lock().unwrap();
            let st = &mut *guard;
            match st.store.find_session_mut(session_id) {
                Some(session) => {
                    for (key, value) in patch {
                        session.config.insert(key, value);
                    }
                    persist(&st.store);
                }
                None => {
                    tracing::warn!("Config update for non-existent session {}", session_id);
                }
            }
        })
    }
}

/// Persistence failures do not roll back the in-memory mutation; the state
/// is kept and the failure is logged (see DESIGN.md).
fn persist(store: &SessionStore) {
    if let Err(e) = store.save() {
        tracing::error!("Failed to persist user store: {:#}", e);
    }
}
