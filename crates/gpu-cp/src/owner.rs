use std::cell::RefCell;
use std::rc::Weak;

use crate::cp::CommandParser;

/// Identity of the subsystem holding the floor on a command parser.
///
/// Compared by value: asking for ownership with the same id twice is not a
/// hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OwnerId {
    #[default]
    None,
    /// 3D draws and the hardware queries that must bracket them.
    QueryRing,
    Blit,
}

/// Called when an owner loses the command parser, either to another owner or
/// to a flush. Implicit flushes are forbidden for the duration of the call, so
/// the hook may only emit what its reservation covers.
pub trait OwnerRelease {
    fn release(&mut self, cp: &mut CommandParser);
}

pub type ReleaseHook = Weak<RefCell<dyn OwnerRelease>>;
