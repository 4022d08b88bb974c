//! A device abstraction for managed WiFi connectivity: scans for the
//! configured access points, joins the best one, watches link and IP
//! health, and retries on failure.
//!
//! The decision logic lives in [`machine`]; this module owns the radio,
//! the network stack and the periodic worker that drives the machine.

pub mod machine;

#[cfg(not(feature = "host"))]
mod device {
    #![allow(clippy::future_not_send, reason = "single-threaded")]
    #![allow(
        unsafe_code,
        reason = "StackStorage uses UnsafeCell in single-threaded context"
    )]

    use core::cell::{RefCell, UnsafeCell};
    use core::str;

    use cyw43::{JoinOptions, ScanOptions};
    use cyw43_pio::{DEFAULT_CLOCK_DIVIDER, PioSpi};
    use defmt::{info, unwrap, warn};
    use embassy_executor::Spawner;
    use embassy_net::{Config, Stack, StackResources};
    use embassy_rp::clocks::RoscRng;
    use embassy_rp::gpio::{Level, Output};
    use embassy_rp::peripherals::{DMA_CH0, PIN_23, PIN_24, PIN_25, PIN_29, PIO0};
    use embassy_rp::pio::{InterruptHandler, Pio};
    use embassy_rp::{Peri, bind_interrupts};
    use embassy_sync::blocking_mutex::{Mutex, raw::CriticalSectionRawMutex};
    use embassy_sync::signal::Signal;
    use embassy_time::{Duration, Instant, Ticker, with_timeout};
    use heapless::String;
    use portable_atomic::{AtomicBool, Ordering};
    use rand_core::RngCore as _;
    use static_cell::StaticCell;

    use super::machine::{
        CONNECT_TIMEOUT_TIME_MS, Command, ConnectionMachine, ConnectionState, LinkStatus,
        LinkView, PERIODIC_TIME_MS,
    };
    use crate::Result;
    use crate::board;
    use crate::flash_layout::FlashLayout;
    use crate::settings::Blob;

    /// Events emitted while connecting and while watching the link.
    #[derive(Clone, Copy, Debug, defmt::Format)]
    pub enum WifiManagerEvent {
        /// Radio and network stack are up; the manager is idle.
        Ready,
        /// Joined an access point and acquired an IPv4 address.
        Connected,
        /// Link or IP was lost; the manager is reconnecting.
        ConnectionLost,
        /// No access points are configured in the settings store.
        StorageEmpty,
    }

    type ManagerEvents = Signal<CriticalSectionRawMutex, WifiManagerEvent>;
    type SharedMachine = Mutex<CriticalSectionRawMutex, RefCell<ConnectionMachine>>;

    /// Single-threaded once-storage for the network stack.
    ///
    /// SAFETY: This is safe in single-threaded Embassy context
    struct StackStorage {
        initialized: AtomicBool,
        ready: Signal<CriticalSectionRawMutex, ()>,
        value: UnsafeCell<Option<&'static Stack<'static>>>,
    }

    // SAFETY: We're in a single-threaded context (Embassy on Pico)
    unsafe impl Sync for StackStorage {}

    impl StackStorage {
        const fn new() -> Self {
            Self {
                initialized: AtomicBool::new(false),
                ready: Signal::new(),
                value: UnsafeCell::new(None),
            }
        }

        fn init(&self, stack: &'static Stack<'static>) {
            // SAFETY: This is called once from the manager task
            unsafe {
                *self.value.get() = Some(stack);
            }
            self.initialized.store(true, Ordering::Release);
            self.ready.signal(());
        }

        async fn get(&self) -> &'static Stack<'static> {
            if !self.initialized.load(Ordering::Acquire) {
                self.ready.wait().await;
            }
            // SAFETY: initialized is true, so value is set
            unsafe { (*self.value.get()).unwrap() }
        }

        fn try_get(&self) -> Option<&'static Stack<'static>> {
            if self.initialized.load(Ordering::Acquire) {
                // SAFETY: initialized is true, so value is set
                unsafe { *self.value.get() }
            } else {
                None
            }
        }
    }

    /// Static resources for [`WifiManager`].
    pub struct WifiManagerStatic {
        events: ManagerEvents,
        machine: SharedMachine,
        stack: StackStorage,
        leave_pending: AtomicBool,
        shutdown: AtomicBool,
        manager_cell: StaticCell<WifiManager>,
    }

    /// A device abstraction that keeps the board joined to one of the
    /// configured access points.
    ///
    /// The manager idles in `Disconnected` after construction; call
    /// [`connect`](Self::connect) to start. Progress arrives via
    /// [`wait_event`](Self::wait_event).
    pub struct WifiManager {
        events: &'static ManagerEvents,
        machine: &'static SharedMachine,
        stack: &'static StackStorage,
        leave_pending: &'static AtomicBool,
        shutdown: &'static AtomicBool,
        layout: FlashLayout,
    }

    impl WifiManager {
        #[must_use]
        pub const fn new_static() -> WifiManagerStatic {
            WifiManagerStatic {
                events: Signal::new(),
                machine: Mutex::new(RefCell::new(ConnectionMachine::new())),
                stack: StackStorage::new(),
                leave_pending: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                manager_cell: StaticCell::new(),
            }
        }

        /// Bring up the radio and network stack and start the periodic
        /// worker. The manager idles until [`connect`](Self::connect).
        #[allow(clippy::too_many_arguments, reason = "one parameter per CYW43 pin")]
        pub fn new(
            manager_static: &'static WifiManagerStatic,
            pin_23: Peri<'static, PIN_23>,
            pin_25: Peri<'static, PIN_25>,
            pio0: Peri<'static, PIO0>,
            pin_24: Peri<'static, PIN_24>,
            pin_29: Peri<'static, PIN_29>,
            dma_ch0: Peri<'static, DMA_CH0>,
            spawner: Spawner,
        ) -> Result<&'static Self> {
            let token = unwrap!(manager_task(
                pin_23,
                pin_25,
                pio0,
                pin_24,
                pin_29,
                dma_ch0,
                &manager_static.events,
                &manager_static.machine,
                &manager_static.stack,
                &manager_static.leave_pending,
                &manager_static.shutdown,
                spawner,
            ));
            spawner.spawn(token);
            Ok(manager_static.manager_cell.init(Self {
                events: &manager_static.events,
                machine: &manager_static.machine,
                stack: &manager_static.stack,
                leave_pending: &manager_static.leave_pending,
                shutdown: &manager_static.shutdown,
                layout: board::flash_layout(),
            }))
        }

        /// Wait for the next manager event.
        pub async fn wait_event(&self) -> WifiManagerEvent {
            self.events.wait().await
        }

        /// Wait for the network stack to be ready and return it.
        pub async fn stack(&self) -> &'static Stack<'static> {
            self.stack.get().await
        }

        /// Start connecting. A no-op unless currently disconnected.
        pub fn connect(&self) {
            self.machine.lock(|cell| cell.borrow_mut().connect());
        }

        /// Leave the network (if joined) and go idle.
        pub fn disconnect(&self) {
            let leave = self.machine.lock(|cell| cell.borrow_mut().disconnect());
            if leave.is_some() {
                self.leave_pending.store(true, Ordering::Relaxed);
            }
        }

        /// Stop the periodic worker and leave any network. Idempotent.
        pub fn deinit(&self) {
            self.shutdown.store(true, Ordering::Relaxed);
        }

        /// True while joined with a live link and an IPv4 address.
        #[must_use]
        pub fn is_connected(&self) -> bool {
            let joined = self
                .machine
                .lock(|cell| cell.borrow().state() == ConnectionState::ConnectedIp);
            joined && self.stack.try_get().is_some_and(Stack::is_link_up)
        }

        /// True when not even the first access-point slot is configured.
        #[must_use]
        pub fn has_no_wifi_details(&self) -> bool {
            Blob::new(board::settings_text(&self.layout)).has_no_wifi_details()
        }

        /// One-line connection summary for UIs and logs.
        #[must_use]
        pub fn connect_status(&self) -> String<96> {
            let mut text = String::new();
            self.machine.lock(|cell| {
                let _ = cell.borrow().write_connect_status(&mut text);
            });
            text
        }

        /// One-line radio hardware summary.
        #[must_use]
        pub fn hardware_status(&self) -> String<64> {
            let mut text = String::new();
            self.machine.lock(|cell| {
                let _ = cell.borrow().write_hardware_status(&mut text);
            });
            text
        }

        /// One-line IP configuration summary.
        #[must_use]
        pub fn ip_status(&self) -> String<48> {
            use core::fmt::Write as _;
            let mut text = String::new();
            match self.stack.try_get().and_then(Stack::config_v4) {
                Some(config) => {
                    let _ = write!(text, "ip {}", config.address);
                }
                None => {
                    let _ = text.push_str("no ip");
                }
            }
            text
        }
    }

    bind_interrupts!(struct Irqs {
        PIO0_IRQ_0 => InterruptHandler<PIO0>;
    });

    /// Join status codes reported by the radio firmware on a failed
    /// `SET_SSID`: 8 and 16 are WPA handshake failures.
    const fn classify_join_status(status: u32) -> LinkStatus {
        match status {
            8 | 16 => LinkStatus::BadAuth,
            _ => LinkStatus::Failed,
        }
    }

    #[embassy_executor::task]
    #[allow(clippy::too_many_arguments, reason = "one parameter per CYW43 pin")]
    async fn manager_task(
        pin_23: Peri<'static, PIN_23>,
        pin_25: Peri<'static, PIN_25>,
        pio0: Peri<'static, PIO0>,
        pin_24: Peri<'static, PIN_24>,
        pin_29: Peri<'static, PIN_29>,
        dma_ch0: Peri<'static, DMA_CH0>,
        events: &'static ManagerEvents,
        machine: &'static SharedMachine,
        stack_storage: &'static StackStorage,
        leave_pending: &'static AtomicBool,
        shutdown: &'static AtomicBool,
        spawner: Spawner,
    ) -> ! {
        let layout = board::flash_layout();

        // Regulatory hint and DHCP hostname come from the settings store.
        let mut hostname: String<32> = String::new();
        {
            let blob = Blob::new(board::settings_text(&layout));
            // The pinned cyw43 Control API has no country/CLM override; the
            // CLM blob loaded below is the worldwide one, so the configured
            // country can only be logged here until the driver grows one.
            if let Some(country) = blob.country() {
                info!(
                    "Regulatory domain hint: {}",
                    str::from_utf8(&country).unwrap_or("??")
                );
            }
            let mut name_buf = [0u8; 32];
            let name_len = blob.hostname(&mut name_buf).unwrap_or(0);
            if let Ok(text) = str::from_utf8(&name_buf[..name_len]) {
                let _ = hostname.push_str(text);
            }
        }

        // Initialize WiFi hardware
        let fw = cyw43_firmware::CYW43_43439A0;
        let clm = cyw43_firmware::CYW43_43439A0_CLM;

        let pwr = Output::new(pin_23, Level::Low);
        let cs = Output::new(pin_25, Level::High);
        let mut pio = Pio::new(pio0, Irqs);
        let spi = PioSpi::new(
            &mut pio.common,
            pio.sm0,
            DEFAULT_CLOCK_DIVIDER,
            pio.irq0,
            cs,
            pin_24,
            pin_29,
            dma_ch0,
        );

        static STATE: StaticCell<cyw43::State> = StaticCell::new();
        let state = STATE.init(cyw43::State::new());
        let (net_device, mut control, runner) = cyw43::new(state, pwr, spi, fw).await;
        let wifi_token = unwrap!(wifi_task(runner));
        spawner.spawn(wifi_token);

        control.init(clm).await;
        control
            .set_power_management(cyw43::PowerManagementMode::PowerSave)
            .await;

        let mut dhcp_config = embassy_net::DhcpConfig::default();
        if !hostname.is_empty() {
            dhcp_config.hostname = Some(hostname);
        }
        let config = Config::dhcpv4(dhcp_config);
        let seed = RoscRng.next_u64();

        static RESOURCES: StaticCell<StackResources<5>> = StaticCell::new();
        static STACK: StaticCell<Stack<'static>> = StaticCell::new();
        let (stack_val, runner) = embassy_net::new(
            net_device,
            config,
            RESOURCES.init(StackResources::<5>::new()),
            seed,
        );
        let stack = STACK.init(stack_val);

        let net_token = unwrap!(net_task(runner));
        spawner.spawn(net_token);

        stack_storage.init(stack);
        machine.lock(|cell| cell.borrow_mut().initialised());
        events.signal(WifiManagerEvent::Ready);
        info!("WiFi manager ready");

        let mut ticker = Ticker::every(Duration::from_millis(PERIODIC_TIME_MS));
        // Join failure carried into the next tick's link view.
        let mut pending_failure: Option<LinkStatus> = None;

        loop {
            ticker.next().await;

            if shutdown.load(Ordering::Relaxed) {
                control.leave().await;
                machine.lock(|cell| cell.borrow_mut().deinitialised());
                info!("WiFi manager stopped");
                loop {
                    embassy_time::Timer::after_secs(3600).await;
                }
            }
            if leave_pending.swap(false, Ordering::Relaxed) {
                control.leave().await;
                pending_failure = None;
            }

            let link_up = stack.is_link_up();
            let link = LinkView {
                scan_active: false,
                link: if link_up {
                    LinkStatus::Up
                } else {
                    pending_failure.take().unwrap_or(LinkStatus::Down)
                },
                ipv4: stack
                    .config_v4()
                    .map(|config| config.address.address().octets()),
            };

            let previous = machine.lock(|cell| cell.borrow().state());
            let command = machine.lock(|cell| {
                let blob = Blob::new(board::settings_text(&layout));
                cell.borrow_mut()
                    .tick(&blob, link, Instant::now().as_millis())
            });

            match command {
                Some(Command::StartScan) => {
                    control.leave().await;
                    info!("Scanning for configured access points");
                    let mut scanner = control.scan(ScanOptions::default()).await;
                    while let Some(bss) = scanner.next().await {
                        let ssid_len = usize::from(bss.ssid_len).min(bss.ssid.len());
                        machine.lock(|cell| {
                            cell.borrow_mut()
                                .on_scan_result(&bss.ssid[..ssid_len], bss.bssid);
                        });
                    }
                }
                Some(Command::Join {
                    ssid,
                    passphrase,
                    open,
                }) => {
                    control.leave().await;
                    let ssid_str = str::from_utf8(&ssid).unwrap_or("");
                    info!("Joining {}", ssid_str);
                    let options = if open {
                        JoinOptions::new_open()
                    } else {
                        JoinOptions::new(&passphrase)
                    };
                    let timeout = Duration::from_millis(CONNECT_TIMEOUT_TIME_MS);
                    match with_timeout(timeout, control.join(ssid_str, options)).await {
                        Ok(Ok(())) => pending_failure = None,
                        Ok(Err(err)) => {
                            warn!("Join failed (status {})", err.status);
                            pending_failure = Some(classify_join_status(err.status));
                        }
                        Err(_) => pending_failure = Some(LinkStatus::Down),
                    }
                }
                Some(Command::Leave) => control.leave().await,
                None => {}
            }

            let current = machine.lock(|cell| cell.borrow().state());
            if current != previous {
                match current {
                    ConnectionState::ConnectedIp => events.signal(WifiManagerEvent::Connected),
                    ConnectionState::StorageEmptyError => {
                        events.signal(WifiManagerEvent::StorageEmpty);
                    }
                    ConnectionState::TryToConnect
                        if previous == ConnectionState::ConnectedIp =>
                    {
                        events.signal(WifiManagerEvent::ConnectionLost);
                    }
                    _ => {}
                }
            }
        }
    }

    #[embassy_executor::task]
    async fn wifi_task(
        runner: cyw43::Runner<'static, Output<'static>, PioSpi<'static, PIO0, 0, DMA_CH0>>,
    ) -> ! {
        runner.run().await
    }

    #[embassy_executor::task]
    async fn net_task(mut runner: embassy_net::Runner<'static, cyw43::NetDriver<'static>>) -> ! {
        runner.run().await
    }
}

#[cfg(not(feature = "host"))]
pub use device::{WifiManager, WifiManagerEvent, WifiManagerStatic};
