//! The remote control service device: accepts one TCP session at a time on
//! port 1404, pumps it through the [`Session`] state machine, and answers
//! UDP discovery queries alongside.

#![allow(clippy::future_not_send, reason = "single-threaded")]

use core::cell::RefCell;
use core::str;

use defmt::{info, unwrap, warn};
use embassy_executor::Spawner;
use embassy_net::Stack;
use embassy_net::tcp::TcpSocket;
use embassy_rp::clocks::RoscRng;
use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
use embedded_io_async::Write as _;
use heapless::String;
use static_cell::StaticCell;

use crate::board::{self, FlashController};
use crate::flash_layout::FlashLayout;
use crate::remote::builtin::{InfoHandler, UpdateRebootHandler, UpdateSettingsHandler};
#[cfg(feature = "memory-access")]
use crate::remote::builtin::{OtaUpdateHandler, ReadMemoryHandler, WriteFlashHandler};
use crate::remote::crypto::HashedSecret;
use crate::remote::discovery::discovery_task;
use crate::remote::handlers::{Handler, Registry, USER_HANDLER_ID_FIRST, handler_id};
use crate::remote::session::Session;
use crate::remote::wire::{BOARD_ID_LEN, PORT};
use crate::settings::{Blob, MAX_SECRET_LEN, SettingsStore};
use crate::{Error, Result};

/// Human-readable identity sent in the greeting.
const VERSION_TEXT: &str = concat!("wifi-kit ", env!("CARGO_PKG_VERSION"));

/// Optional extras for [`RemoteControl::new`].
pub struct RemoteConfig {
    /// Application handlers, ids in `128..=143`.
    pub user_handlers: &'static [(u8, Handler)],
}

impl RemoteConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self { user_handlers: &[] }
    }

    #[must_use]
    pub const fn with_user_handlers(mut self, handlers: &'static [(u8, Handler)]) -> Self {
        self.user_handlers = handlers;
        self
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the service, its tasks and the built-in handlers.
pub(crate) struct ServiceShared {
    pub(crate) store:
        Mutex<CriticalSectionRawMutex, RefCell<SettingsStore<&'static FlashController>>>,
    pub(crate) secret: Mutex<CriticalSectionRawMutex, RefCell<Option<HashedSecret>>>,
    pub(crate) hostname: Mutex<CriticalSectionRawMutex, RefCell<String<32>>>,
    pub(crate) layout: FlashLayout,
    pub(crate) board_id: [u8; BOARD_ID_LEN],
    pub(crate) stack: &'static Stack<'static>,
    #[cfg(feature = "memory-access")]
    pub(crate) flash: &'static FlashController,
    pub(crate) version: &'static str,
}

impl ServiceShared {
    pub(crate) fn board_id_str(&self) -> &str {
        // The board id is ASCII hex by construction.
        str::from_utf8(&self.board_id).unwrap_or("")
    }

    /// Re-read `update_secret` and `name` from the settings sector; called
    /// at start-up and after every settings rewrite.
    pub(crate) fn refresh_from_settings(&self) {
        let blob = Blob::new(board::settings_text(&self.layout));

        let mut secret_buf = [0u8; MAX_SECRET_LEN];
        let secret_len = blob.update_secret(&mut secret_buf).unwrap_or(0);
        let hashed = HashedSecret::derive(&secret_buf[..secret_len]);
        if hashed.is_none() {
            warn!("No update secret configured; remote access is disabled");
        }
        self.secret.lock(|cell| *cell.borrow_mut() = hashed);

        let mut name_buf = [0u8; 32];
        let name_len = blob.hostname(&mut name_buf).unwrap_or(0);
        self.hostname.lock(|cell| {
            let mut hostname = cell.borrow_mut();
            hostname.clear();
            if let Ok(text) = str::from_utf8(&name_buf[..name_len]) {
                let _ = hostname.push_str(text);
            }
        });
    }
}

/// Static resources for [`RemoteControl`].
pub struct RemoteControlStatic {
    shared_cell: StaticCell<ServiceShared>,
    registry_cell: StaticCell<Registry>,
    handlers_cell: StaticCell<BuiltinHandlers>,
    control_cell: StaticCell<RemoteControl>,
}

struct BuiltinHandlers {
    info: InfoHandler,
    update: UpdateSettingsHandler,
    update_reboot: UpdateRebootHandler,
    #[cfg(feature = "memory-access")]
    read: ReadMemoryHandler,
    #[cfg(feature = "memory-access")]
    write: WriteFlashHandler,
    #[cfg(feature = "memory-access")]
    ota: OtaUpdateHandler,
}

/// A device abstraction for the authenticated remote control service.
///
/// Construct it once the network stack is up (typically after
/// [`WifiManager`](crate::connection::WifiManager) reports a connection);
/// it spawns the TCP listener and the UDP discovery responder.
pub struct RemoteControl {
    shared: &'static ServiceShared,
}

impl RemoteControl {
    #[must_use]
    pub const fn new_static() -> RemoteControlStatic {
        RemoteControlStatic {
            shared_cell: StaticCell::new(),
            registry_cell: StaticCell::new(),
            handlers_cell: StaticCell::new(),
            control_cell: StaticCell::new(),
        }
    }

    pub fn new(
        remote_static: &'static RemoteControlStatic,
        stack: &'static Stack<'static>,
        flash: &'static FlashController,
        config: RemoteConfig,
        spawner: Spawner,
    ) -> Result<&'static Self> {
        let layout = board::flash_layout();
        let board_id = flash.board_id()?;
        let store = SettingsStore::new(flash, layout.settings_range());

        let shared = remote_static.shared_cell.init(ServiceShared {
            store: Mutex::new(RefCell::new(store)),
            secret: Mutex::new(RefCell::new(None)),
            hostname: Mutex::new(RefCell::new(String::new())),
            layout,
            board_id,
            stack,
            #[cfg(feature = "memory-access")]
            flash,
            version: VERSION_TEXT,
        });
        shared.refresh_from_settings();

        let handlers = remote_static.handlers_cell.init(BuiltinHandlers {
            info: InfoHandler { shared },
            update: UpdateSettingsHandler { shared },
            update_reboot: UpdateRebootHandler { shared },
            #[cfg(feature = "memory-access")]
            read: ReadMemoryHandler { shared },
            #[cfg(feature = "memory-access")]
            write: WriteFlashHandler { shared },
            #[cfg(feature = "memory-access")]
            ota: OtaUpdateHandler { shared },
        });

        let mut registry = Registry::new();
        registry.register(handler_id::INFO, Handler::OneShot(&handlers.info))?;
        registry.register(
            handler_id::UPDATE_SETTINGS,
            Handler::OneShot(&handlers.update),
        )?;
        registry.register(
            handler_id::UPDATE_REBOOT,
            Handler::TwoStage(&handlers.update_reboot),
        )?;
        #[cfg(feature = "memory-access")]
        {
            registry.register(handler_id::READ_MEMORY, Handler::OneShot(&handlers.read))?;
            registry.register(handler_id::WRITE_FLASH, Handler::OneShot(&handlers.write))?;
            registry.register(handler_id::OTA_UPDATE, Handler::TwoStage(&handlers.ota))?;
        }
        for (id, handler) in config.user_handlers {
            if *id < USER_HANDLER_ID_FIRST {
                return Err(Error::InvalidArg);
            }
            registry.register(*id, *handler)?;
        }
        let registry = remote_static.registry_cell.init(registry);

        let token = unwrap!(listener_task(shared, registry));
        spawner.spawn(token);
        let token = unwrap!(discovery_task(stack, board_id));
        spawner.spawn(token);

        Ok(remote_static.control_cell.init(Self { shared }))
    }

    /// Re-derive the hashed secret and hostname from the settings sector.
    pub fn refresh_secret(&self) {
        self.shared.refresh_from_settings();
    }

    /// The 16-character hex identity used in the greeting and discovery.
    #[must_use]
    pub fn board_id(&self) -> &[u8; BOARD_ID_LEN] {
        &self.shared.board_id
    }

    /// False when no `update_secret` is configured (clients get
    /// `NO_SECRET_ERROR`).
    #[must_use]
    pub fn has_secret(&self) -> bool {
        self.shared.secret.lock(|cell| cell.borrow().is_some())
    }
}

/// One client at a time: a single socket realizes the backlog of 1; while a
/// session runs, further connection attempts are refused by the stack.
#[embassy_executor::task]
async fn listener_task(shared: &'static ServiceShared, registry: &'static Registry) -> ! {
    let mut rx_buffer = [0u8; 2048];
    let mut tx_buffer = [0u8; 2048];

    info!("Remote control listening on TCP {}", PORT);

    loop {
        let mut socket = TcpSocket::new(*shared.stack, &mut rx_buffer, &mut tx_buffer);
        if let Err(err) = socket.accept(PORT).await {
            warn!("Remote accept error: {:?}", err);
            continue;
        }
        info!("Remote client connected: {:?}", socket.remote_endpoint());

        let secret = shared.secret.lock(|cell| cell.borrow().clone());
        let mut rng = RoscRng;
        let mut session = Session::new(
            registry,
            secret.as_ref(),
            &shared.board_id,
            shared.version,
            &mut rng,
        );
        run_session(&mut socket, &mut session).await;

        let _ = socket.flush().await;
        socket.close();
        info!("Remote client disconnected");
    }
}

/// Pump bytes between the socket and the session until either side is done.
async fn run_session(socket: &mut TcpSocket<'_>, session: &mut Session<'_>) {
    let mut buf = [0u8; 256];
    loop {
        if session.is_closed() {
            break;
        }
        if let Some(block) = session.transmit() {
            let block = *block;
            let must_flush = session.commit_follows();
            if socket.write_all(&block).await.is_err() {
                break;
            }
            if must_flush && socket.flush().await.is_err() {
                break;
            }
            session.transmitted();
            continue;
        }
        if socket.flush().await.is_err() {
            break;
        }
        match socket.read(&mut buf).await {
            Ok(0) => break,
            Ok(len) => session.receive(&buf[..len]),
            Err(_) => break,
        }
    }
}
