//! Event kinds and the facility mask a binding filters them with.

use std::fmt;

use bitflags::bitflags;

/// Opaque event tag. The core never looks inside payloads; the tag only selects
/// which facility bit must be set for the record to be emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKind(u16);

impl EventKind {
    pub const SYSCALL: EventKind = EventKind(1);
    pub const SYSRET: EventKind = EventKind(2);
    pub const NAMEI: EventKind = EventKind(3);
    pub const GENIO: EventKind = EventKind(4);
    pub const PSIG: EventKind = EventKind(5);
    pub const CSW: EventKind = EventKind(6);
    pub const EMUL: EventKind = EventKind(7);
    pub const USER: EventKind = EventKind(8);
    pub const EXEC_ARG: EventKind = EventKind(10);
    pub const EXEC_ENV: EventKind = EventKind(11);

    /// Highest tag that still maps onto a facility bit.
    pub const MAX: u16 = 23;

    pub const fn new(raw: u16) -> Self {
        EventKind(raw)
    }

    pub const fn raw(self) -> u16 {
        self.0
    }

    /// The single facility bit selecting this kind; empty for tags above [`Self::MAX`].
    pub const fn facility(self) -> Facilities {
        if self.0 > Self::MAX {
            Facilities::empty()
        } else {
            Facilities::from_bits_retain(1 << self.0)
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kind#{}", self.0)
    }
}

bitflags! {
    /// Which event kinds a bound context emits, plus binding modifiers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Facilities: u32 {
        const SYSCALL = 1 << 1;
        const SYSRET = 1 << 2;
        const NAMEI = 1 << 3;
        const GENIO = 1 << 4;
        const PSIG = 1 << 5;
        const CSW = 1 << 6;
        const EMUL = 1 << 7;
        const USER = 1 << 8;
        const EXEC_ARG = 1 << 10;
        const EXEC_ENV = 1 << 11;

        /// Children created through `Tracer::inherit` share the parent's binding.
        const INHERIT = 0x4000_0000;
        /// Set by privileged requesters; kept across credential changes.
        const PERSISTENT = 0x8000_0000;

        const _ = !0;
    }
}

impl Facilities {
    /// Bits that select event kinds (as opposed to modifiers).
    pub const EVENT_MASK: Facilities = Facilities::from_bits_retain(0x00ff_ffff);

    /// Everything the default `ktrace` invocation records.
    pub const DEFAULT_POINTS: Facilities = Facilities::SYSCALL
        .union(Facilities::SYSRET)
        .union(Facilities::NAMEI)
        .union(Facilities::GENIO)
        .union(Facilities::PSIG)
        .union(Facilities::EMUL)
        .union(Facilities::USER);

    pub fn events(self) -> Facilities {
        self & Facilities::EVENT_MASK
    }

    pub fn traces(self, kind: EventKind) -> bool {
        let bit = kind.facility();
        !bit.is_empty() && self.contains(bit)
    }
}
