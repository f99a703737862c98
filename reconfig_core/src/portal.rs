//! Portals: switches from unit-side ports to one permanent channel.
//!
//! Each unit bound to a portal gets its own [`Accessor`]. Only the accessor
//! of the unit the portal is OPEN toward is connected to the permanent
//! channel; the others answer from the fallback interface or wait.
//! All units share the portal's driver objects, so calls replayed through
//! them reach the permanent channel from one task, whichever unit issued
//! them.

use std::cell::RefCell;
use std::rc::Rc;

use reconfig_env::SharedContext;

use crate::accessor::{Accessor, Forwarder};
use crate::channel::FallbackInterface;
use crate::driver::{DriverMode, DriverStats, PortalDrivers};
use crate::error::{ReconfigError, Result};
use crate::state::{SwitchKind, UnitId, UnitState};
use crate::switch::{SwitchBackend, SwitchCore, SwitchHandle, SwitchHooks};
use crate::unit::ReconfigurableUnit;

struct PortalInner<I: ?Sized> {
    core: Rc<SwitchCore>,
    channel: RefCell<Option<Rc<I>>>,
    fallback: Rc<I>,
    accessors: RefCell<Vec<(UnitId, Rc<Forwarder<I>>)>>,
    hooks: RefCell<Vec<Rc<dyn SwitchHooks<I>>>>,
    drivers: Rc<PortalDrivers>,
}

impl<I: ?Sized + 'static> PortalInner<I> {
    fn forwarder(&self, unit: UnitId) -> Option<Rc<Forwarder<I>>> {
        self.accessors
            .borrow()
            .iter()
            .find(|(id, _)| *id == unit)
            .map(|(_, fwd)| fwd.clone())
    }

    fn run_hooks(&self, f: impl Fn(&dyn SwitchHooks<I>, Option<&I>)) {
        let hooks = self.hooks.borrow().clone();
        let channel = self.channel.borrow().clone();
        for hook in hooks {
            f(hook.as_ref(), channel.as_deref());
        }
    }
}

impl<I: ?Sized + 'static> SwitchBackend for PortalInner<I> {
    fn kind(&self) -> SwitchKind {
        SwitchKind::Portal
    }

    fn interface_name(&self) -> &'static str {
        std::any::type_name::<I>()
    }

    fn check_ready(&self, unit: UnitId) -> std::result::Result<(), String> {
        if self.channel.borrow().is_none() {
            return Err("no permanent channel bound".into());
        }
        if self.forwarder(unit).is_none() {
            return Err(format!("{unit} is not bound"));
        }
        Ok(())
    }

    fn open(&self, switch: &SwitchHandle, unit: UnitId) {
        let channel = self.channel.borrow().clone();
        if let (Some(fwd), Some(channel)) = (self.forwarder(unit), channel) {
            fwd.connect(channel);
        }
        self.run_hooks(|h, ch| h.on_open(switch, ch));
    }

    fn close(&self, switch: &SwitchHandle, unit: UnitId) {
        if let Some(fwd) = self.forwarder(unit) {
            fwd.disconnect();
        }
        self.run_hooks(|h, ch| h.on_close(switch, ch));
    }

    fn undefine(&self, switch: &SwitchHandle, unit: UnitId) {
        if let Some(fwd) = self.forwarder(unit) {
            fwd.disconnect();
        }
        self.run_hooks(|h, ch| h.on_undefined(switch, ch));
    }

    fn refresh(&self, switch: &SwitchHandle) {
        let accessors: Vec<_> = self
            .accessors
            .borrow()
            .iter()
            .map(|(_, fwd)| fwd.clone())
            .collect();
        for fwd in accessors {
            if fwd.current().is_some() {
                fwd.refresh();
            }
        }
        self.run_hooks(|h, ch| h.on_refresh(switch, ch));
    }

    fn unbind(&self, unit: UnitId) {
        let removed: Vec<_> = {
            let mut accessors = self.accessors.borrow_mut();
            let (gone, kept) = accessors.drain(..).partition(|(id, _)| *id == unit);
            *accessors = kept;
            gone
        };
        for (_, fwd) in removed {
            fwd.disconnect();
        }
    }
}

/// A switch from unit-side ports to one permanent channel of interface `I`.
pub struct Portal<I: ?Sized> {
    inner: Rc<PortalInner<I>>,
}

impl<I: ?Sized> Clone for Portal<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<I: ?Sized + FallbackInterface + 'static> Portal<I> {
    /// Creates a portal with the interface's own fallback and a dedicated
    /// non-blocking driver.
    pub fn new(ctx: &SharedContext, name: impl Into<String>) -> Self {
        Self::with_fallback(ctx, name, I::fallback(), DriverMode::Dedicated)
    }

    /// Creates a portal using `mode` for its non-blocking driver.
    pub fn with_driver_mode(ctx: &SharedContext, name: impl Into<String>, mode: DriverMode) -> Self {
        Self::with_fallback(ctx, name, I::fallback(), mode)
    }
}

impl<I: ?Sized + 'static> Portal<I> {
    /// Creates a portal with a custom fallback implementation.
    pub fn with_fallback(
        ctx: &SharedContext,
        name: impl Into<String>,
        fallback: Rc<I>,
        mode: DriverMode,
    ) -> Self {
        let name = name.into();
        Self {
            inner: Rc::new(PortalInner {
                drivers: Rc::new(PortalDrivers::new(ctx, &name, mode)),
                core: SwitchCore::new(name),
                channel: RefCell::new(None),
                fallback,
                accessors: RefCell::new(Vec::new()),
                hooks: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Binds the permanent side. Allowed once.
    pub fn bind_static(&self, channel: Rc<I>) -> Result<()> {
        let mut slot = self.inner.channel.borrow_mut();
        if slot.is_some() {
            return Err(ReconfigError::binding(
                self.name(),
                "permanent channel already bound",
            ));
        }
        *slot = Some(channel);
        Ok(())
    }

    /// True once the permanent side is bound.
    pub fn is_static_bound(&self) -> bool {
        self.inner.channel.borrow().is_some()
    }

    /// Binds `unit` to the portal and returns the accessor its ports call
    /// through. The unit must be UNLOADED.
    pub fn bind(&self, unit: &ReconfigurableUnit) -> Result<Accessor<I>> {
        if unit.state() != UnitState::Unloaded || unit.is_changing() {
            return Err(ReconfigError::usage(
                unit.name(),
                format!("cannot bind to switch '{}' unless UNLOADED", self.name()),
            ));
        }
        self.inner.core.add_bound(unit)?;
        let fwd = Forwarder::new(
            self.inner.core.clone(),
            format!("{}@{}", self.name(), unit.name()),
            self.inner.fallback.clone(),
            Some(self.inner.drivers.clone()),
        );
        self.inner
            .accessors
            .borrow_mut()
            .push((unit.id(), fwd.clone()));
        unit.attach_switch(self.switch());
        Ok(Accessor::new(fwd))
    }

    /// The accessor of a bound unit.
    pub fn accessor(&self, unit: &ReconfigurableUnit) -> Option<Accessor<I>> {
        self.inner.forwarder(unit.id()).map(Accessor::new)
    }

    pub fn switch(&self) -> SwitchHandle {
        SwitchHandle::new(self.inner.core.clone(), self.inner.clone())
    }

    pub fn add_hooks(&self, hooks: Rc<dyn SwitchHooks<I>>) {
        self.inner.hooks.borrow_mut().push(hooks);
    }

    pub fn refresh_notify(&self) {
        self.switch().refresh_notify();
    }

    pub fn driver_stats(&self) -> DriverStats {
        self.inner.drivers.stats()
    }
}
