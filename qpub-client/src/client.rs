//! Instance construction and the two client roles.
//!
//! Collaborators are wired explicitly at construction: each instance owns
//! its options, auth manager, transport(s) and — for the streaming role —
//! the connection manager task. There is no runtime service lookup; test
//! seams are the injected backend handle and the instruction channel.

use crate::{
    auth::AuthManager,
    channel::{registry::SharedBuses, Channels},
    connection::{Connection, ConnectionManager, Instruction, SharedStatus},
    error::Error,
    options::ClientOptions,
    rest::RestChannels,
    transport::http::HttpRequester,
};
use futures_channel::{mpsc, oneshot};
use qpub_core::{
    events::EventBus,
    instance::{InstanceId, InstanceRole},
};
use std::{
    fmt,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

fn require_credentials(options: &ClientOptions) -> Result<(), Error> {
    if options.has_credentials() {
        Ok(())
    } else {
        Err(Error::Config(
            "no credentials configured: provide a key, token, token request or auth url".into(),
        ))
    }
}

/// The streaming instance: a long-lived bidirectional session with
/// subscribable channels.
///
/// Must be constructed inside a tokio runtime; construction spawns the
/// connection manager task.
pub struct QPub {
    instance_id: InstanceId,
    options: Arc<ClientOptions>,
    auth: AuthManager,
    channels: Channels,
    connection: Connection,
    cancel: Mutex<CancellationToken>,
}

impl QPub {
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        require_credentials(&options)?;
        let options = Arc::new(options);
        let instance_id = InstanceId::generate(InstanceRole::Socket);
        let cancel = CancellationToken::new();

        let http = HttpRequester::new(options.http_url()?);
        let auth = AuthManager::new(options.clone(), http, cancel.clone())?;

        let (instruction_tx, instruction_rx) = mpsc::unbounded();
        let events = Arc::new(EventBus::new());
        let status: SharedStatus = Default::default();
        let buses: SharedBuses = Default::default();

        ConnectionManager::new(
            options.clone(),
            auth.clone(),
            instruction_rx,
            instruction_tx.clone(),
            events.clone(),
            status.clone(),
            buses.clone(),
            cancel.clone(),
        )
        .spawn();

        let connection = Connection::new(
            instruction_tx.clone(),
            events,
            status,
            options.connect_timeout,
            options.ping_timeout,
        );
        let channels = Channels::new(instruction_tx, buses, options.operation_timeout);

        let client = Self {
            instance_id,
            options,
            auth,
            channels,
            connection,
            cancel: Mutex::new(cancel),
        };
        if client.options.auto_connect {
            let (reply, _rx) = oneshot::channel();
            let _ = client.connection.instruct(Instruction::Connect { reply });
        }
        Ok(client)
    }

    /// This instance's identifier; stable for its whole lifetime, including
    /// across [`QPub::reset`].
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub async fn connect(&self) -> Result<(), Error> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) -> Result<(), Error> {
        self.connection.disconnect().await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub async fn ping(&self) -> Result<Duration, Error> {
        self.connection.ping().await
    }

    /// Tears the instance down to its initial state: aborts in-flight
    /// authentication, rejects queued and in-flight channel operations with
    /// [`Error::Cancelled`], drops the transport, and installs a fresh
    /// cancellation token. Idempotent. The instance id is untouched.
    pub async fn reset(&self) {
        let fresh = CancellationToken::new();
        let previous = {
            let mut guard = self.cancel.lock().unwrap();
            std::mem::replace(&mut *guard, fresh.clone())
        };
        previous.cancel();
        self.auth.reset(fresh.clone());

        let (reply, rx) = oneshot::channel();
        if self.connection.instruct(Instruction::Reset { cancel: fresh, reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl fmt::Debug for QPub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QPub").field("instance_id", &self.instance_id).finish_non_exhaustive()
    }
}

/// The request instance: stateless publish-only access over HTTP.
pub struct QPubRest {
    instance_id: InstanceId,
    options: Arc<ClientOptions>,
    auth: AuthManager,
    http: HttpRequester,
    channels: RestChannels,
    cancel: Mutex<CancellationToken>,
}

impl QPubRest {
    pub fn new(options: ClientOptions) -> Result<Self, Error> {
        require_credentials(&options)?;
        let options = Arc::new(options);
        let instance_id = InstanceId::generate(InstanceRole::Rest);
        let cancel = CancellationToken::new();

        let http = HttpRequester::new(options.http_url()?);
        let auth = AuthManager::new(options.clone(), http.clone(), cancel.clone())?;
        let channels = RestChannels::new(http.clone(), auth.clone());

        Ok(Self { instance_id, options, auth, http, channels, cancel: Mutex::new(cancel) })
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn channels(&self) -> &RestChannels {
        &self.channels
    }

    /// Raw access to the HTTP surface.
    pub fn http(&self) -> &HttpRequester {
        &self.http
    }

    /// Aborts in-flight authentication work and installs a fresh
    /// cancellation token. The instance id is untouched.
    pub fn reset(&self) {
        let fresh = CancellationToken::new();
        let previous = {
            let mut guard = self.cancel.lock().unwrap();
            std::mem::replace(&mut *guard, fresh.clone())
        };
        previous.cancel();
        self.auth.reset(fresh);
    }
}

impl fmt::Debug for QPubRest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QPubRest")
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}
