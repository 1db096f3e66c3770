//! Virtual to physical translation.
//!
//! Every translator answers "which guest-physical address backs VA `va` in
//! process `pid`", with 0 meaning not present.

mod agent;
mod beacon;

pub use agent::{AgentTranslator, PagemapSource};
pub use beacon::BeaconTranslator;

use crate::error::{HaywireError, Result};

pub enum Translator {
    /// PTEs streamed by the companion's cameras
    Beacon(BeaconTranslator),
    /// Pagemap reads through the guest agent
    Agent(AgentTranslator),
    /// Addresses are already physical
    Identity,
}

impl Translator {
    pub fn translate(&self, pid: u32, va: u64) -> u64 {
        match self {
            Translator::Beacon(t) => t.translate(pid, va),
            Translator::Agent(t) => t.translate(pid, va),
            Translator::Identity => va,
        }
    }

    /// Like [`translate`](Self::translate) but absence is an error
    pub fn try_translate(&self, pid: u32, va: u64) -> Result<u64> {
        match self.translate(pid, va) {
            0 if !matches!(self, Translator::Identity) => {
                Err(HaywireError::TranslationAbsent { pid, va })
            }
            pa => Ok(pa),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Translator::Beacon(_) => "beacon",
            Translator::Agent(_) => "agent",
            Translator::Identity => "identity",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::agent::tests::EvenPages;
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_identity() {
        let t = Translator::Identity;
        assert_eq!(t.translate(1, 0x1234), 0x1234);
        assert_eq!(t.try_translate(1, 0).unwrap(), 0);
    }

    #[test]
    fn test_absent_is_error() {
        let t = Translator::Agent(AgentTranslator::new(EvenPages {
            calls: Arc::new(AtomicUsize::new(0)),
            fail: false,
        }));
        assert_eq!(t.try_translate(3, 0x2004).unwrap(), (0x102 << 12) + 4);
        let err = t.try_translate(3, 0x1000).err().unwrap();
        assert!(matches!(err, HaywireError::TranslationAbsent { pid: 3, va: 0x1000 }));
        assert!(err.is_recoverable());
    }
}
