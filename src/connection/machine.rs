//! The periodic connection state machine.
//!
//! One tick runs roughly every second. The machine never touches the radio
//! itself: it consumes a snapshot of the link ([`LinkView`]) plus the
//! settings blob and emits at most one [`Command`] per tick, which the
//! device task executes against the driver. Scan results and nothing else
//! arrive between ticks via [`ConnectionMachine::on_scan_result`].

use core::fmt;

use heapless::Vec;

use crate::settings::{Blob, MAX_SSIDS};

/// Interval between ticks.
pub const PERIODIC_TIME_MS: u64 = 1000;

/// How long one join attempt may take before the slot is marked `Timeout`.
pub const CONNECT_TIMEOUT_TIME_MS: u64 = 30_000;

/// Holdoff before rescanning after a scan that found none of the slots.
pub const REPEAT_SCAN_TIME_MS: u64 = 30_000;

const SLOT_COUNT: usize = MAX_SSIDS as usize;

/// Overall state of the manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialised,
    InitialisationError,
    StorageEmptyError,
    Disconnected,
    TryToConnect,
    Scanning,
    Connecting,
    ConnectedIp,
}

impl ConnectionState {
    const fn name(self) -> &'static str {
        match self {
            Self::Uninitialised => "uninitialised",
            Self::InitialisationError => "initialisation error",
            Self::StorageEmptyError => "no access points configured",
            Self::Disconnected => "disconnected",
            Self::TryToConnect => "waiting to scan",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::ConnectedIp => "connected",
        }
    }
}

/// Outcome of the most recent activity on each slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SlotStatus {
    #[default]
    NotFound,
    Found,
    Attempt,
    Failed,
    BadAuth,
    Timeout,
    Success,
    Lost,
}

/// Link status as reported by the driver, folded to what the machine needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Down,
    Joining,
    Up,
    BadAuth,
    Failed,
}

/// Snapshot of driver/stack state taken just before a tick.
#[derive(Clone, Copy, Debug)]
pub struct LinkView {
    pub scan_active: bool,
    pub link: LinkStatus,
    /// Acquired IPv4 address; `None` or all-zero counts as "no IP yet".
    pub ipv4: Option<[u8; 4]>,
}

impl LinkView {
    const fn has_ipv4(&self) -> bool {
        matches!(self.ipv4, Some(addr) if u32::from_be_bytes(addr) != 0)
    }
}

/// What the device task must do after a tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Leave any current network and start a fresh scan.
    StartScan,
    /// Leave any current network and join `ssid` (empty passphrase = open).
    Join {
        ssid: Vec<u8, 32>,
        passphrase: Vec<u8, 64>,
        open: bool,
    },
    /// Force-leave the current network.
    Leave,
}

/// Per-slot configuration cached when a scan begins, so result callbacks can
/// be matched without re-reading flash.
#[derive(Clone, Default)]
struct SlotConfig {
    configured: bool,
    ssid: Vec<u8, 32>,
    bssid: Option<[u8; 6]>,
    /// SSID observed in the scan result that matched this slot; joins use
    /// this for BSSID-configured slots.
    seen_ssid: Vec<u8, 32>,
}

/// The connection manager's single mutable context.
pub struct ConnectionMachine {
    state: ConnectionState,
    /// 1-based; 0 means no slot selected.
    selected_slot: u8,
    slot_status: [SlotStatus; SLOT_COUNT],
    slots: [SlotConfig; SLOT_COUNT],
    scan_holdoff_deadline: u64,
    connect_deadline: u64,
    hw_error: i32,
}

impl ConnectionMachine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Uninitialised,
            selected_slot: 0,
            slot_status: [SlotStatus::NotFound; SLOT_COUNT],
            slots: core::array::from_fn(|_| SlotConfig::default()),
            scan_holdoff_deadline: 0,
            connect_deadline: 0,
            hw_error: 0,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// 1-based slot currently selected for joining, 0 when none.
    #[must_use]
    pub const fn selected_slot(&self) -> u8 {
        self.selected_slot
    }

    #[must_use]
    pub fn slot_status(&self, n: u8) -> SlotStatus {
        debug_assert!(n >= 1 && n <= MAX_SSIDS);
        self.slot_status[usize::from(n - 1)]
    }

    #[must_use]
    pub const fn hardware_error(&self) -> i32 {
        self.hw_error
    }

    /// Hardware came up; the manager idles until `connect` is called.
    pub fn initialised(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::Uninitialised);
        self.state = ConnectionState::Disconnected;
    }

    /// Hardware init reported `code`; the manager stays in error until
    /// deinitialised.
    pub fn initialisation_failed(&mut self, code: i32) {
        self.hw_error = code;
        self.state = ConnectionState::InitialisationError;
    }

    pub fn deinitialised(&mut self) {
        *self = Self::new();
    }

    /// Begin connecting. A no-op unless currently `Disconnected`.
    pub fn connect(&mut self) {
        if self.state == ConnectionState::Disconnected {
            self.state = ConnectionState::TryToConnect;
            self.scan_holdoff_deadline = 0;
        }
    }

    /// Force-leave and go idle. Returns the leave command when the radio may
    /// be associated.
    pub fn disconnect(&mut self) -> Option<Command> {
        match self.state {
            ConnectionState::Uninitialised | ConnectionState::InitialisationError => None,
            ConnectionState::Disconnected => None,
            state => {
                let was_active = matches!(
                    state,
                    ConnectionState::Scanning
                        | ConnectionState::Connecting
                        | ConnectionState::ConnectedIp
                );
                self.selected_slot = 0;
                self.state = ConnectionState::Disconnected;
                was_active.then_some(Command::Leave)
            }
        }
    }

    #[must_use]
    pub fn is_connected(&self, link_up: bool) -> bool {
        self.state == ConnectionState::ConnectedIp && link_up
    }

    /// Record one scan result. Only meaningful while `Scanning`.
    ///
    /// A BSSID match takes priority and marks its slot regardless of the
    /// advertised SSID; otherwise every BSSID-less slot whose configured
    /// SSID equals the result's SSID is marked. Slots already past `Found`
    /// (a previous attempt this round) stay put until the next scan resets
    /// them.
    pub fn on_scan_result(&mut self, ssid: &[u8], bssid: [u8; 6]) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        for (slot, status) in self.slots.iter_mut().zip(self.slot_status.iter_mut()) {
            if slot.configured && slot.bssid == Some(bssid) {
                if *status == SlotStatus::NotFound {
                    *status = SlotStatus::Found;
                    slot.seen_ssid = Vec::from_slice(ssid).unwrap_or_default();
                }
                return;
            }
        }
        for (slot, status) in self.slots.iter_mut().zip(self.slot_status.iter_mut()) {
            if slot.configured
                && slot.bssid.is_none()
                && !slot.ssid.is_empty()
                && slot.ssid.as_slice() == ssid
                && *status == SlotStatus::NotFound
            {
                *status = SlotStatus::Found;
                slot.seen_ssid = slot.ssid.clone();
            }
        }
    }

    /// Advance the machine by one periodic tick.
    pub fn tick(&mut self, settings: &Blob<'_>, link: LinkView, now_ms: u64) -> Option<Command> {
        match self.state {
            ConnectionState::Uninitialised
            | ConnectionState::InitialisationError
            | ConnectionState::Disconnected => None,

            ConnectionState::StorageEmptyError => {
                if any_slot_configured(settings) {
                    self.state = ConnectionState::TryToConnect;
                }
                None
            }

            ConnectionState::TryToConnect => {
                if !any_slot_configured(settings) {
                    self.state = ConnectionState::StorageEmptyError;
                    return Some(Command::Leave);
                }
                if now_ms < self.scan_holdoff_deadline {
                    return None;
                }
                self.load_slots(settings);
                self.slot_status = [SlotStatus::NotFound; SLOT_COUNT];
                self.selected_slot = 0;
                self.state = ConnectionState::Scanning;
                Some(Command::StartScan)
            }

            ConnectionState::Scanning => {
                if link.scan_active {
                    return None;
                }
                match self.lowest_found_slot() {
                    Some(n) => self.begin_join(settings, n, now_ms),
                    None => {
                        self.scan_holdoff_deadline = now_ms + REPEAT_SCAN_TIME_MS;
                        self.selected_slot = 0;
                        self.state = ConnectionState::TryToConnect;
                        None
                    }
                }
            }

            ConnectionState::Connecting => {
                let slot = usize::from(self.selected_slot - 1);
                match link.link {
                    LinkStatus::BadAuth => {
                        self.slot_status[slot] = SlotStatus::BadAuth;
                        self.state = ConnectionState::Scanning;
                        Some(Command::Leave)
                    }
                    LinkStatus::Failed => {
                        self.slot_status[slot] = SlotStatus::Failed;
                        self.state = ConnectionState::Scanning;
                        Some(Command::Leave)
                    }
                    LinkStatus::Up if link.has_ipv4() => {
                        self.slot_status[slot] = SlotStatus::Success;
                        self.state = ConnectionState::ConnectedIp;
                        None
                    }
                    LinkStatus::Up | LinkStatus::Joining | LinkStatus::Down => {
                        if now_ms >= self.connect_deadline {
                            self.slot_status[slot] = SlotStatus::Timeout;
                            self.state = ConnectionState::Scanning;
                            Some(Command::Leave)
                        } else {
                            None
                        }
                    }
                }
            }

            ConnectionState::ConnectedIp => {
                if link.link == LinkStatus::Up && link.has_ipv4() {
                    return None;
                }
                let slot = usize::from(self.selected_slot - 1);
                self.slot_status[slot] = SlotStatus::Lost;
                self.selected_slot = 0;
                self.state = ConnectionState::TryToConnect;
                self.scan_holdoff_deadline = 0;
                None
            }
        }
    }

    /// One-line human-readable summary of the connection state.
    pub fn write_connect_status(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        match self.state {
            ConnectionState::Connecting | ConnectionState::ConnectedIp => {
                let slot = usize::from(self.selected_slot - 1);
                write!(out, "{} to ", self.state.name())?;
                write_bytes(out, &self.slots[slot].seen_ssid)?;
                write!(out, " (slot {})", self.selected_slot)
            }
            state => write!(out, "{}", state.name()),
        }
    }

    /// One-line summary of the radio hardware state.
    pub fn write_hardware_status(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        if self.state == ConnectionState::InitialisationError {
            write!(out, "radio init failed (code {})", self.hw_error)
        } else if self.state == ConnectionState::Uninitialised {
            write!(out, "radio not initialised")
        } else {
            write!(out, "radio ready")
        }
    }

    fn lowest_found_slot(&self) -> Option<u8> {
        self.slot_status
            .iter()
            .position(|status| *status == SlotStatus::Found)
            .map(|index| index as u8 + 1)
    }

    /// Re-read slot `n` from settings and emit the join command; if the
    /// record vanished since the scan (settings rewritten mid-scan), the
    /// slot ends as `Attempt` and a fresh round begins instead.
    fn begin_join(&mut self, settings: &Blob<'_>, n: u8, now_ms: u64) -> Option<Command> {
        let index = usize::from(n - 1);
        self.slot_status[index] = SlotStatus::Attempt;

        let mut ssid_buf = [0u8; 32];
        let current_ssid = settings.ssid(n, &mut ssid_buf);
        let current_bssid = settings.bssid(n);
        let cached = &self.slots[index];

        let still_matches = match cached.bssid {
            Some(bssid) => current_bssid == Some(bssid),
            None => current_ssid
                .is_some_and(|len| ssid_buf[..len] == *cached.ssid.as_slice()),
        };
        if !still_matches {
            self.selected_slot = 0;
            self.state = ConnectionState::TryToConnect;
            return None;
        }

        let mut pass_buf = [0u8; 64];
        let pass_len = settings.password(n, &mut pass_buf).unwrap_or(0);

        self.selected_slot = n;
        self.connect_deadline = now_ms + CONNECT_TIMEOUT_TIME_MS;
        self.state = ConnectionState::Connecting;
        Some(Command::Join {
            ssid: self.slots[index].seen_ssid.clone(),
            passphrase: Vec::from_slice(&pass_buf[..pass_len]).unwrap_or_default(),
            open: pass_len == 0,
        })
    }

    fn load_slots(&mut self, settings: &Blob<'_>) {
        for n in 1..=MAX_SSIDS {
            let slot = &mut self.slots[usize::from(n - 1)];
            let mut ssid_buf = [0u8; 32];
            let ssid_len = settings.ssid(n, &mut ssid_buf);
            slot.bssid = settings.bssid(n);
            slot.ssid = ssid_len
                .map(|len| Vec::from_slice(&ssid_buf[..len]).unwrap_or_default())
                .unwrap_or_default();
            slot.configured = ssid_len.is_some() || slot.bssid.is_some();
            slot.seen_ssid = slot.ssid.clone();
        }
    }
}

impl Default for ConnectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

fn any_slot_configured(settings: &Blob<'_>) -> bool {
    (1..=MAX_SSIDS).any(|n| {
        let mut ssid_buf = [0u8; 32];
        settings.ssid(n, &mut ssid_buf).is_some() || settings.bssid(n).is_some()
    })
}

fn write_bytes(out: &mut dyn fmt::Write, bytes: &[u8]) -> fmt::Result {
    match core::str::from_utf8(bytes) {
        Ok(text) => out.write_str(text),
        Err(_) => out.write_str("<non-utf8>"),
    }
}
