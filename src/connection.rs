use crate::auth::{AuthStateStore, select_backend};
use crate::dispatch::notify_crm;
use crate::engine::{InstanceState, RegistrySignal, SessionEngine};
use crate::error::{EngineError, Result};
use crate::protocol::{JidFilter, ProtocolSession, SocketConfig};
use crate::qrcode::{self, QrArtifact};
use crate::types::events::{
    ConnectionPhase, ConnectionUpdate, DisconnectReason, EventBatch, EventName,
};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};

impl SessionEngine {
    /// Starts one connect attempt: loads (or reuses) the auth state,
    /// builds the socket configuration and creates the session. A second
    /// call while an attempt is in flight is rejected, so concurrent
    /// connects collapse to a single socket.
    pub async fn connect(self: &Arc<Self>, number: Option<String>, mobile: bool) -> Result<()> {
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyConnecting);
        }
        let _guard = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::Relaxed);
        });

        if self.connection_status().await.state == InstanceState::Open {
            return Err(EngineError::AlreadyConnected);
        }

        self.reconnect_pending.store(false, Ordering::Relaxed);
        self.end_session.store(false, Ordering::Relaxed);
        if number.is_some() {
            *self.phone_number.write().await = number;
        }
        self.mobile.store(mobile, Ordering::Relaxed);

        self.set_state(InstanceState::Connecting, 200).await;
        self.emit(EventName::ConnectionUpdate, self.state_payload().await);

        let auth = match self.ensure_auth_store().await {
            Ok(auth) => auth,
            Err(e) => {
                self.set_state(InstanceState::Close, DisconnectReason::BadSession.code())
                    .await;
                self.emit(EventName::ConnectionUpdate, self.state_payload().await);
                error!(target: "Connection", "Credential loading failed: {e}");
                return Err(e);
            }
        };

        let config = self.build_socket_config(auth).await;
        let (session, events) = match self.factory.create(config).await {
            Ok(created) => created,
            Err(e) => {
                self.set_state(InstanceState::Close, DisconnectReason::ConnectionLost.code())
                    .await;
                self.emit(EventName::ConnectionUpdate, self.state_payload().await);
                self.schedule_reconnect();
                return Err(EngineError::ConnectionInit(e.to_string()));
            }
        };

        *self.session.write().await = Some(session.clone());
        *self.last_connect.lock().await = Some(Utc::now());
        self.spawn_event_loop(session, events);
        Ok(())
    }

    /// Rebuilds the socket configuration and swaps in a fresh session
    /// without moving the state machine, reusing the same auth state.
    /// Used after a settings change.
    pub async fn reload(self: &Arc<Self>) -> Result<()> {
        let auth = self.auth_store().await.ok_or(EngineError::NotConnected)?;

        let config = self.build_socket_config(auth).await;
        let (session, events) = self
            .factory
            .create(config)
            .await
            .map_err(|e| EngineError::ConnectionInit(e.to_string()))?;

        let old = self.session.write().await.replace(session.clone());
        if let Some(old) = old {
            old.close().await;
        }
        self.spawn_event_loop(session, events);
        Ok(())
    }

    /// Explicit, user-invoked logout: clean transport logout plus socket
    /// close. The reconnect branch is skipped entirely.
    pub async fn logout(&self) -> Result<()> {
        info!(target: "Connection", "Logging out instance '{}'", self.instance_name());

        self.end_session.store(true, Ordering::Relaxed);
        if let Some(session) = self.current_session().await {
            if let Err(e) = session.logout().await {
                warn!(target: "Connection", "Transport logout failed: {e}");
            }
            session.close().await;
        }
        *self.session.write().await = None;

        self.set_state(InstanceState::Close, DisconnectReason::LoggedOut.code())
            .await;
        self.emit(
            EventName::StatusInstance,
            json!({ "instance": self.instance_name(), "status": "closed" }),
        );
        Ok(())
    }

    async fn ensure_auth_store(&self) -> Result<Arc<AuthStateStore>> {
        if let Some(auth) = self.auth_store().await {
            return Ok(auth);
        }

        let backend = select_backend(
            &self.config,
            self.auth_provider.clone(),
            &self.cache,
            self.database.clone(),
        );
        let auth = AuthStateStore::open(self.instance_id(), backend).await?;
        auth.clone().run_background_saver(
            Duration::from_secs(self.config.auth_save_interval_secs),
            self.shutdown_notifier.clone(),
        );
        *self.auth_store.write().await = Some(auth.clone());
        Ok(auth)
    }

    async fn build_socket_config(self: &Arc<Self>, auth: Arc<AuthStateStore>) -> SocketConfig {
        let settings = self.settings().await;
        SocketConfig {
            instance_name: self.instance_name().to_string(),
            auth,
            jid_filter: JidFilter {
                ignore_groups: settings.groups_ignore,
                ignore_broadcast: !settings.read_status,
            },
            sync_full_history: settings.sync_full_history,
            mark_online_on_connect: settings.always_online,
            connect_timeout: Duration::from_secs(60),
            qr_timeout: Duration::from_secs(40),
            retry_request_delay: Duration::from_millis(10),
            resolver: self.message_resolver(),
            patch_message: crate::protocol::patch_outbound_message,
        }
    }

    /// Single consumption point for the session's event batches. One
    /// batch is processed fully before the next is taken, which is the
    /// ordering guarantee the store relies on.
    fn spawn_event_loop(
        self: &Arc<Self>,
        session: Arc<dyn ProtocolSession>,
        mut events: mpsc::Receiver<EventBatch>,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = engine.shutdown_notifier.notified() => return,
                    batch = events.recv() => match batch {
                        Some(batch) => engine.process_batch(batch).await,
                        None => break,
                    }
                }
            }

            // The transport dropped its sender without a close event. If
            // this loop's session is still the active one, treat it as a
            // lost connection.
            let still_active = engine
                .current_session()
                .await
                .is_some_and(|current| Arc::ptr_eq(&current, &session));
            if still_active && !engine.end_session.load(Ordering::Relaxed) {
                debug!(target: "Connection", "Event stream ended without close, reconnecting");
                engine.cleanup_connection_state().await;
                engine.schedule_reconnect();
            }
        });
    }

    pub(crate) async fn handle_connection_update(self: &Arc<Self>, update: ConnectionUpdate) {
        if let Some(phase) = update.connection {
            let status_reason = update.last_disconnect.map(|r| r.code()).unwrap_or(200);
            let state = match phase {
                ConnectionPhase::Connecting => InstanceState::Connecting,
                ConnectionPhase::Open => InstanceState::Open,
                ConnectionPhase::Close => InstanceState::Close,
            };
            self.set_state(state, status_reason).await;
            self.emit(EventName::ConnectionUpdate, self.state_payload().await);

            match phase {
                ConnectionPhase::Close => {
                    let reason = update
                        .last_disconnect
                        .unwrap_or(DisconnectReason::ConnectionClosed);
                    self.handle_close(reason).await;
                }
                ConnectionPhase::Open => self.handle_open().await,
                ConnectionPhase::Connecting => {
                    if self.mobile.load(Ordering::Relaxed) {
                        self.request_mobile_pairing_code().await;
                    }
                }
            }
        }

        if let Some(qr) = &update.qr {
            self.handle_qr(qr).await;
        }
    }

    /// The single most important lifecycle policy: every disconnect
    /// reason reconnects except an explicit logout, which is terminal.
    async fn handle_close(self: &Arc<Self>, reason: DisconnectReason) {
        self.cleanup_connection_state().await;

        if self.end_session.load(Ordering::Relaxed) {
            debug!(target: "Connection", "Session ended, skipping reconnect");
            return;
        }

        if reason.should_reconnect() {
            info!(
                target: "Connection",
                "Connection closed ({reason:?}), reconnecting instance '{}'",
                self.instance_name()
            );
            self.schedule_reconnect();
        } else {
            info!(
                target: "Connection",
                "Instance '{}' logged out, closing for good",
                self.instance_name()
            );
            self.end_session.store(true, Ordering::Relaxed);

            let status = json!({ "instance": self.instance_name(), "status": "closed" });
            self.emit(EventName::StatusInstance, status.clone());
            notify_crm(
                &self.crm,
                self.instance_name(),
                EventName::StatusInstance,
                status,
            );
            self.signal_registry(RegistrySignal::LoggedOut {
                instance: self.instance_name().to_string(),
            });
        }
    }

    async fn handle_open(self: &Arc<Self>) {
        self.reconnect_errors.store(0, Ordering::Relaxed);

        let Some(session) = self.current_session().await else {
            return;
        };
        let wuid = session.own_jid().map(|jid| jid.to_non_device());
        let picture_url = match &wuid {
            Some(wuid) => self.fetch_profile_picture(wuid).await,
            None => None,
        };
        let push_name = match self.auth_store().await {
            Some(auth) => auth.snapshot().await.creds.push_name,
            None => None,
        };

        {
            let mut profile = self.profile.write().await;
            profile.wuid = wuid.clone();
            profile.picture_url = picture_url;
            if push_name.is_some() {
                profile.name = push_name;
            }
        }

        info!(
            target: "Connection",
            "Instance '{}' connected as {}",
            self.instance_name(),
            wuid.map(|j| j.to_string()).unwrap_or_else(|| "<unknown>".to_string())
        );

        notify_crm(
            &self.crm,
            self.instance_name(),
            EventName::ConnectionUpdate,
            json!({ "instance": self.instance_name(), "status": "open" }),
        );
    }

    /// QR issuance. A bounded counter guards against infinite QR churn:
    /// once the configured limit is reached the pairing attempt is
    /// refused and the registry is told to drop the instance.
    async fn handle_qr(self: &Arc<Self>, qr: &str) {
        let issued = self.qr.read().await.count;
        if issued >= self.config.qr.limit {
            warn!(
                target: "Connection",
                "QR code limit reached for instance '{}'",
                self.instance_name()
            );

            let limit_payload = json!({
                "message": "QR code limit reached, please login again",
                "status_code": DisconnectReason::BadSession.code(),
            });
            self.emit(EventName::QrcodeUpdated, limit_payload.clone());
            notify_crm(
                &self.crm,
                self.instance_name(),
                EventName::QrcodeUpdated,
                limit_payload,
            );

            self.set_state(
                InstanceState::Refused,
                DisconnectReason::ConnectionClosed.code(),
            )
            .await;
            self.emit(EventName::ConnectionUpdate, self.state_payload().await);

            self.end_session.store(true, Ordering::Relaxed);
            self.signal_registry(RegistrySignal::Refused {
                instance: self.instance_name().to_string(),
            });
            return;
        }

        let count = issued + 1;
        let phone_number = self.phone_number.read().await.clone();
        let pairing_code = match (&phone_number, self.current_session().await) {
            (Some(number), Some(session)) => match session.request_pairing_code(number).await {
                Ok(code) => Some(code),
                Err(e) => {
                    warn!(target: "Connection", "Pairing code request failed: {e}");
                    None
                }
            },
            _ => None,
        };

        let svg = match qrcode::render_svg(qr, &self.config.qr.color) {
            Ok(svg) => svg,
            Err(e) => {
                error!(target: "Connection", "Qrcode generate failed: {e}");
                return;
            }
        };

        let artifact = QrArtifact {
            code: Some(qr.to_string()),
            base64: Some(qrcode::svg_data_url(&svg)),
            pairing_code: pairing_code.clone(),
            count,
        };
        *self.qr.write().await = artifact.clone();

        let state = if phone_number.is_some() {
            InstanceState::PairingPending
        } else {
            InstanceState::QrPending
        };
        self.set_state(state, 200).await;

        let payload = json!({
            "qrcode": {
                "instance": self.instance_name(),
                "pairing_code": artifact.pairing_code,
                "code": artifact.code,
                "base64": artifact.base64,
            }
        });
        self.emit(EventName::QrcodeUpdated, payload.clone());
        notify_crm(
            &self.crm,
            self.instance_name(),
            EventName::QrcodeUpdated,
            payload,
        );

        match qrcode::render_terminal(qr) {
            Ok(block) => info!(
                target: "Connection",
                "{{ instance: {}, pairingCode: {:?}, qrcodeCount: {} }}\n{block}",
                self.instance_name(),
                pairing_code,
                count
            ),
            Err(e) => error!(target: "Connection", "Terminal qrcode render failed: {e}"),
        }
    }

    /// Requests an alternate pairing code during the connecting phase of
    /// a number-registered connect.
    async fn request_mobile_pairing_code(self: &Arc<Self>) {
        let Some(number) = self.phone_number.read().await.clone() else {
            return;
        };
        let Some(session) = self.current_session().await else {
            return;
        };
        match session.request_pairing_code(&number).await {
            Ok(code) => {
                self.qr.write().await.pairing_code = Some(code.clone());
                self.emit(
                    EventName::QrcodeUpdated,
                    json!({ "qrcode": { "instance": self.instance_name(), "pairing_code": code } }),
                );
            }
            Err(e) => warn!(target: "Connection", "Mobile pairing code request failed: {e}"),
        }
    }

    /// Arms a delayed reconnect, never more than one at a time.
    pub(crate) fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let engine = self.clone();
        tokio::spawn(async move {
            let error_count = engine.reconnect_errors.fetch_add(1, Ordering::SeqCst);
            let delay = engine.config.reconnect.delay_for(error_count);
            info!(
                target: "Connection",
                "Will attempt to reconnect in {delay:?} (attempt {})",
                error_count + 1
            );

            tokio::select! {
                biased;
                _ = engine.shutdown_notifier.notified() => return,
                _ = sleep(delay) => {}
            }

            if engine.end_session.load(Ordering::Relaxed) {
                return;
            }
            let number = engine.phone_number.read().await.clone();
            let mobile = engine.mobile.load(Ordering::Relaxed);
            if let Err(e) = engine.connect(number, mobile).await {
                warn!(target: "Connection", "Reconnect attempt failed: {e}");
            }
        });
    }

    pub(crate) async fn cleanup_connection_state(&self) {
        if let Some(session) = self.session.write().await.take() {
            session.close().await;
        }
    }

    /// Flushes credentials when the transport signals a mutation.
    pub(crate) async fn handle_creds_update(&self) {
        if let Some(auth) = self.auth_store().await
            && let Err(e) = auth.flush().await
        {
            error!(target: "Connection", "Failed to persist credentials: {e}");
        }
    }

    async fn set_state(&self, state: InstanceState, status_reason: u16) {
        let mut guard = self.state.write().await;
        guard.state = state;
        guard.status_reason = status_reason;
    }
}
