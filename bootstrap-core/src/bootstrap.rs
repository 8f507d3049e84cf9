// Power-on sequencing: network, config, bring-up, plugins, app hooks, OTA, loop

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::LevelFilter;

use crate::bringup::{BringUp, Link, WifiEventSource};
use crate::config::{ConfigError, ConfigStore, DeviceConfig, DEFAULT_CONFIG_LABEL};
use crate::connection::WifiDriver;
use crate::error::{DriverError, PluginError, RestartReason};
use crate::identity::FirmwareIdentity;
use crate::ota::{FirmwareSlots, FirmwareUpdater, UpdateError, UpdateTransport};
use crate::schedule::FixedPeriod;

pub const DEFAULT_LOOP_PERIOD: Duration = Duration::from_millis(100);

/// Device control. `restart` is the only way out of the bootstrap.
pub trait System: Send + Sync {
    fn restart(&self, reason: RestartReason) -> !;

    /// Why the previous run ended, for the boot log.
    fn last_reset_reason(&self) -> String {
        "unknown".to_string()
    }
}

/// Application hooks. `init` runs before the network is up, `start` after
/// the update check, `loop_once` once per loop period.
pub trait Application {
    fn init(&mut self, config: &DeviceConfig);
    fn start(&mut self);
    fn loop_once(&mut self);
}

/// Optional subsystem brought up during boot. A failed `init` is fatal.
pub trait Plugin {
    fn name(&self) -> &'static str;
    fn init(&mut self, config: &DeviceConfig) -> Result<(), DriverError>;
    fn on_loop(&mut self) {}
}

/// Hardware the bootstrap needs, one associated type per collaborator.
pub trait Platform {
    type Wifi: WifiDriver + 'static;
    type Events: WifiEventSource;
    type Transport: UpdateTransport;
    type Slots: FirmwareSlots;
    type Sys: System + 'static;

    fn system(&self) -> Arc<Self::Sys>;

    /// Bring up the network stack and hand out the station driver together
    /// with its event source. Nothing is started or scanned yet.
    fn init_network(&mut self) -> Result<(Self::Wifi, Self::Events), DriverError>;

    /// Raw contents of the named data region.
    fn read_config_region(&mut self, label: &str) -> Result<Vec<u8>, ConfigError>;

    fn firmware_identity(&self) -> Result<FirmwareIdentity, DriverError>;
    fn update_transport(&mut self) -> Result<Self::Transport, DriverError>;
    fn firmware_slots(&mut self) -> Result<Self::Slots, DriverError>;
}

pub struct BootOptions {
    pub config_label: String,
    pub loop_period: Duration,
    /// Max log level once the loop starts.
    pub loop_log_level: LevelFilter,
    /// Replaces `net.ip` from the document when set.
    pub ip_override: Option<Ipv4Addr>,
    pub plugins: Vec<Box<dyn Plugin>>,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            config_label: DEFAULT_CONFIG_LABEL.to_string(),
            loop_period: DEFAULT_LOOP_PERIOD,
            loop_log_level: LevelFilter::Warn,
            ip_override: None,
            plugins: Vec::new(),
        }
    }
}

impl BootOptions {
    pub fn config_label(mut self, label: impl Into<String>) -> Self {
        self.config_label = label.into();
        self
    }

    pub fn loop_period(mut self, period: Duration) -> Self {
        self.loop_period = period;
        self
    }

    pub fn loop_log_level(mut self, level: LevelFilter) -> Self {
        self.loop_log_level = level;
        self
    }

    pub fn ip_override(mut self, address: Option<Ipv4Addr>) -> Self {
        self.ip_override = address;
        self
    }

    pub fn plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }
}

pub struct Bootstrap<P, A> {
    platform: P,
    app: A,
    options: BootOptions,
}

impl<P: Platform, A: Application> Bootstrap<P, A> {
    pub fn new(platform: P, app: A, options: BootOptions) -> Self {
        Self {
            platform,
            app,
            options,
        }
    }

    /// Run every boot step up to and including `start()`.
    ///
    /// Startup failures come back as `Err`. Failures after bring-up is
    /// launched restart the device from where they happen.
    pub fn boot(self) -> Result<Launched<P, A>, RestartReason> {
        let Self {
            mut platform,
            mut app,
            options,
        } = self;
        let BootOptions {
            config_label,
            loop_period,
            loop_log_level,
            ip_override,
            mut plugins,
        } = options;

        let system = platform.system();
        log::info!("Boot: previous reset {}", system.last_reset_reason());

        // 1. network subsystem
        let (wifi, events) = platform.init_network().map_err(|e| {
            log::error!("Network init failed: {}", e);
            RestartReason::NetworkInit(e)
        })?;

        // 2. configuration
        let raw = platform.read_config_region(&config_label)?;
        let mut config = ConfigStore::mount(&config_label, &raw)?.into_config();
        if let Some(address) = ip_override {
            log::info!("Static ip overridden at build time: {}", address);
            config = config.with_ip_override(address);
        }

        // 3. bring-up runs on its own worker from here
        let bring_up = BringUp::launch(
            wifi,
            &events,
            config.credentials(),
            &config.static_ip(),
            Arc::clone(&system),
        )?;

        // 4. plugins, in the order given
        for plugin in plugins.iter_mut() {
            log::info!("Initializing plugin '{}'", plugin.name());
            plugin.init(&config).map_err(|source| PluginError {
                plugin: plugin.name(),
                source,
            })?;
        }

        // 5. application init, network may still be coming up
        app.init(&config);

        // 6.
        let link = bring_up.wait()?;

        // 7. a pending update preempts start()
        let identity = platform
            .firmware_identity()
            .map_err(|e| RestartReason::UpdateFailed(UpdateError::Flash(e)))?;
        let transport = platform
            .update_transport()
            .map_err(|e| RestartReason::UpdateFailed(UpdateError::Transport(e)))?;
        let slots = platform
            .firmware_slots()
            .map_err(|e| RestartReason::UpdateFailed(UpdateError::Flash(e)))?;
        let mut updater: FirmwareUpdater<P::Transport, P::Slots> =
            FirmwareUpdater::new(transport, slots);
        match updater.slots().running_slot() {
            Ok(slot) => log::info!("Running from '{}', identity {}", slot.label, identity),
            Err(e) => log::warn!("Running slot unknown: {}", e),
        }
        updater.check_and_apply(config.update_url(), &identity, &*system);

        // 8.
        app.start();
        log::info!("Application started");

        Ok(Launched {
            app,
            plugins,
            timer: FixedPeriod::new(loop_period),
            loop_log_level,
            config,
            link,
            _events: events,
            system,
        })
    }

    /// Boot, then loop forever. Never returns.
    pub fn run(self) -> ! {
        let system = self.platform.system();
        match self.boot() {
            Ok(launched) => launched.run_forever(),
            Err(reason) => {
                log::error!("Boot failed: {}", reason);
                system.restart(reason)
            }
        }
    }
}

/// A booted device: application started, link up, loop not yet entered.
pub struct Launched<P: Platform, A> {
    app: A,
    plugins: Vec<Box<dyn Plugin>>,
    timer: FixedPeriod,
    loop_log_level: LevelFilter,
    config: DeviceConfig,
    link: Link<<P::Events as WifiEventSource>::Subscription>,
    _events: P::Events,
    system: Arc<P::Sys>,
}

impl<P: Platform, A: Application> Launched<P, A> {
    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn system(&self) -> &Arc<P::Sys> {
        &self.system
    }

    /// False once the bring-up worker has exited, which only happens after
    /// the link watch fired or every event source went away.
    pub fn link_watched(&self) -> bool {
        !self.link.worker_finished()
    }

    /// One loop iteration without the period wait.
    pub fn cycle(&mut self) {
        self.app.loop_once();
        for plugin in self.plugins.iter_mut() {
            plugin.on_loop();
        }
    }

    pub fn run_forever(mut self) -> ! {
        log::info!(
            "Entering main loop every {:?}, log level now {}",
            self.timer.period(),
            self.loop_log_level
        );
        log::set_max_level(self.loop_log_level);
        self.timer = FixedPeriod::new(self.timer.period());
        loop {
            self.cycle();
            self.timer.wait();
        }
    }
}
