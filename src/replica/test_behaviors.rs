//! Behaviors and helpers used across manager tests

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::net::bitstream::BitStream;
use crate::replica::behavior::{BehaviorError, ReplicaBehavior, SerializeContext, SerializeMode};
use crate::util::vec3::{Quat, Vec3};

/// Install the env-filtered log subscriber so fault-path warnings show up
/// under `RUST_LOG=debug cargo test -- --nocapture`. Safe to call from every
/// test; only the first call wins.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Position/orientation/health payload. Full mode carries everything;
/// partial mode carries position only (orientation and health are treated as
/// rarely-changing).
#[derive(Debug, Default, Clone)]
pub struct TransformBehavior {
    pub position: Vec3,
    pub orientation: Quat,
    pub health: u32,
}

impl TransformBehavior {
    pub fn at(position: Vec3, health: u32) -> Self {
        Self {
            position,
            orientation: Quat::IDENTITY,
            health,
        }
    }
}

impl ReplicaBehavior for TransformBehavior {
    fn serialize(&self, bs: &mut BitStream, ctx: &SerializeContext) -> Result<(), BehaviorError> {
        bs.write_vec3(self.position);
        if ctx.mode == SerializeMode::Full {
            bs.write_quat(self.orientation);
            bs.write_u32(self.health);
        }
        Ok(())
    }

    fn deserialize(&mut self, bs: &mut BitStream, mode: SerializeMode) -> Result<(), BehaviorError> {
        self.position = bs.read_vec3()?;
        if mode == SerializeMode::Full {
            self.orientation = bs.read_quat()?;
            self.health = bs.read_u32()?;
        }
        Ok(())
    }
}

/// Records RPC dispatches and lifecycle calls for assertions. Clones share
/// the underlying logs, so a prefab factory can hand out instances a test
/// still observes.
#[derive(Clone)]
pub struct SpyBehavior {
    calls: Rc<RefCell<Vec<(u8, u32)>>>,
    detach_count: Rc<Cell<u32>>,
}

impl SpyBehavior {
    pub fn new() -> Self {
        Self {
            calls: Rc::new(RefCell::new(Vec::new())),
            detach_count: Rc::new(Cell::new(0)),
        }
    }

    /// Handle to the (method_id, first u32 argument) dispatch log
    pub fn calls(&self) -> Rc<RefCell<Vec<(u8, u32)>>> {
        Rc::clone(&self.calls)
    }

    pub fn detach_count(&self) -> Rc<Cell<u32>> {
        Rc::clone(&self.detach_count)
    }
}

impl ReplicaBehavior for SpyBehavior {
    fn on_detach(&mut self) {
        self.detach_count.set(self.detach_count.get() + 1);
    }

    fn serialize(&self, _bs: &mut BitStream, _ctx: &SerializeContext) -> Result<(), BehaviorError> {
        Ok(())
    }

    fn deserialize(&mut self, _bs: &mut BitStream, _mode: SerializeMode) -> Result<(), BehaviorError> {
        Ok(())
    }

    fn dispatch_rpc(&mut self, method_id: u8, bs: &mut BitStream) -> Result<(), BehaviorError> {
        let arg = bs.read_u32()?;
        self.calls.borrow_mut().push((method_id, arg));
        Ok(())
    }
}

/// Writes a farewell value at destruction time; the client side records what
/// it read. Clones share the received-value cell.
#[derive(Clone)]
pub struct LastWordsBehavior {
    pub value: u32,
    received: Rc<Cell<u32>>,
}

impl LastWordsBehavior {
    pub fn new(value: u32) -> Self {
        Self {
            value,
            received: Rc::new(Cell::new(0)),
        }
    }

    pub fn received(&self) -> Rc<Cell<u32>> {
        Rc::clone(&self.received)
    }
}

impl ReplicaBehavior for LastWordsBehavior {
    fn serialize(&self, _bs: &mut BitStream, _ctx: &SerializeContext) -> Result<(), BehaviorError> {
        Ok(())
    }

    fn deserialize(&mut self, _bs: &mut BitStream, _mode: SerializeMode) -> Result<(), BehaviorError> {
        Ok(())
    }

    fn serialize_destruction(&self, bs: &mut BitStream) -> Result<(), BehaviorError> {
        bs.write_u32(self.value);
        Ok(())
    }

    fn deserialize_destruction(&mut self, bs: &mut BitStream) -> Result<(), BehaviorError> {
        self.received.set(bs.read_u32()?);
        Ok(())
    }
}

/// Fails its wire hooks on demand
#[derive(Debug, Default)]
pub struct FaultyBehavior {
    pub fail_serialize: bool,
    pub fail_deserialize: bool,
}

impl ReplicaBehavior for FaultyBehavior {
    fn serialize(&self, bs: &mut BitStream, _ctx: &SerializeContext) -> Result<(), BehaviorError> {
        if self.fail_serialize {
            return Err(BehaviorError::Fault("serialize fault injected"));
        }
        bs.write_u8(0);
        Ok(())
    }

    fn deserialize(&mut self, bs: &mut BitStream, _mode: SerializeMode) -> Result<(), BehaviorError> {
        if self.fail_deserialize {
            return Err(BehaviorError::Fault("deserialize fault injected"));
        }
        bs.read_u8()?;
        Ok(())
    }
}
