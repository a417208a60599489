//! Job identifiers and class-instance handles
//!
//! A job id packs everything needed to find the job slot again into 63
//! bits, low to high:
//!
//! | field              | bits | range          |
//! |--------------------|------|----------------|
//! | request id         | 24   | 1..=16_777_215 |
//! | session id         | 17   | 1..=131_071    |
//! | instance id        | 9    | 1..=511        |
//! | service type       | 4    | 1..=15         |
//! | type session index | 9    | 1..=511        |
//!
//! Zero is never valid in any field, so a zero job id is never produced.
//! Decoding here is structural only; whether the id still names a live job
//! is decided by the coordinator's registry.

use thiserror::Error;

const REQ_BITS: u32 = 24;
const SESSION_BITS: u32 = 17;
const INSTANCE_BITS: u32 = 9;
const TYPE_BITS: u32 = 4;
const TYPE_SESSION_BITS: u32 = 9;

const SESSION_SHIFT: u32 = REQ_BITS;
const INSTANCE_SHIFT: u32 = SESSION_SHIFT + SESSION_BITS;
const TYPE_SHIFT: u32 = INSTANCE_SHIFT + INSTANCE_BITS;
const TYPE_SESSION_SHIFT: u32 = TYPE_SHIFT + TYPE_BITS;

const fn mask(bits: u32) -> u64 {
    (1u64 << bits) - 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JobIdError {
    #[error("job id field {field} is zero")]
    ZeroField { field: &'static str },
    #[error("job id field {field} value {value} exceeds {bits} bits")]
    Overflow {
        field: &'static str,
        value: u64,
        bits: u32,
    },
    #[error("job id has bits set above bit 62")]
    ReservedBits,
}

/// The fields packed into a [`JobId`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobIdParts {
    pub req_id: u32,
    pub session_id: u32,
    pub instance_id: u32,
    pub type_id: u8,
    pub type_session_idx: u32,
}

impl JobIdParts {
    fn fields(&self) -> [(&'static str, u64, u32); 5] {
        [
            ("req_id", u64::from(self.req_id), REQ_BITS),
            ("session_id", u64::from(self.session_id), SESSION_BITS),
            ("instance_id", u64::from(self.instance_id), INSTANCE_BITS),
            ("type_id", u64::from(self.type_id), TYPE_BITS),
            ("type_session_idx", u64::from(self.type_session_idx), TYPE_SESSION_BITS),
        ]
    }

    /// Pack the fields into a job id.
    ///
    /// # Errors
    ///
    /// Fails when any field is zero or wider than its bit allocation.
    pub fn pack(&self) -> Result<JobId, JobIdError> {
        for (field, value, bits) in self.fields() {
            if value == 0 {
                return Err(JobIdError::ZeroField { field });
            }
            if value > mask(bits) {
                return Err(JobIdError::Overflow { field, value, bits });
            }
        }
        Ok(JobId(
            u64::from(self.req_id)
                | u64::from(self.session_id) << SESSION_SHIFT
                | u64::from(self.instance_id) << INSTANCE_SHIFT
                | u64::from(self.type_id) << TYPE_SHIFT
                | u64::from(self.type_session_idx) << TYPE_SESSION_SHIFT,
        ))
    }
}

/// Pack a job id, returning 0 on any invalid field.
#[must_use]
pub fn pack_job_id(
    req_id: u32,
    session_id: u32,
    instance_id: u32,
    type_id: u8,
    type_session_idx: u32,
) -> u64 {
    JobIdParts {
        req_id,
        session_id,
        instance_id,
        type_id,
        type_session_idx,
    }
    .pack()
    .map_or(0, JobId::get)
}

/// Bit-packed identifier of one submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u64);

impl JobId {
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The signed form carried in request and response frames
    #[inline]
    #[must_use]
    pub const fn to_wire(self) -> i64 {
        self.0 as i64
    }

    #[inline]
    #[must_use]
    pub const fn from_wire(raw: i64) -> Self {
        Self(raw as u64)
    }

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Split the id into its fields.
    ///
    /// # Errors
    ///
    /// Fails when a field is zero or the top bit is set.
    pub fn unpack(self) -> Result<JobIdParts, JobIdError> {
        if self.0 >> (TYPE_SESSION_SHIFT + TYPE_SESSION_BITS) != 0 {
            return Err(JobIdError::ReservedBits);
        }
        let parts = JobIdParts {
            req_id: (self.0 & mask(REQ_BITS)) as u32,
            session_id: ((self.0 >> SESSION_SHIFT) & mask(SESSION_BITS)) as u32,
            instance_id: ((self.0 >> INSTANCE_SHIFT) & mask(INSTANCE_BITS)) as u32,
            type_id: ((self.0 >> TYPE_SHIFT) & mask(TYPE_BITS)) as u8,
            type_session_idx: ((self.0 >> TYPE_SESSION_SHIFT) & mask(TYPE_SESSION_BITS)) as u32,
        };
        for (field, value, _) in parts.fields() {
            if value == 0 {
                return Err(JobIdError::ZeroField { field });
            }
        }
        Ok(parts)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

// Class-instance handles: session id << 53 | slot << 40 | serial.
const HANDLE_SESSION_SHIFT: u32 = 53;
const HANDLE_SLOT_SHIFT: u32 = 40;
const HANDLE_SLOT_MASK: u64 = 0xfff;

/// Largest serial before wrapping back to 1
pub const MAX_HANDLE_SERIAL: u64 = 0xff_ffff_ffff;

/// Build a class-instance handle. `slot` is the 0-based index of the
/// instance in the session's class table.
#[inline]
#[must_use]
pub const fn pack_class_handle(session_id: u32, slot: u32, serial: u64) -> u64 {
    (session_id as u64) << HANDLE_SESSION_SHIFT
        | ((slot as u64) & HANDLE_SLOT_MASK) << HANDLE_SLOT_SHIFT
        | (serial & MAX_HANDLE_SERIAL)
}

/// Session that owns a class-instance handle
#[inline]
#[must_use]
pub const fn class_handle_session(handle: u64) -> u32 {
    (handle >> HANDLE_SESSION_SHIFT) as u32
}

/// 0-based slot index of a class-instance handle
#[inline]
#[must_use]
pub const fn class_handle_slot(handle: u64) -> u32 {
    ((handle >> HANDLE_SLOT_SHIFT) & HANDLE_SLOT_MASK) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(type_id: u8) -> JobIdParts {
        JobIdParts {
            req_id: 0x00ff_ffff,
            session_id: 0x1_ffff,
            instance_id: 511,
            type_id,
            type_session_idx: 511,
        }
    }

    #[test]
    fn test_type_id_boundary() {
        let id = parts(15).pack().unwrap();
        assert_eq!(id.unpack().unwrap(), parts(15));
        assert!(id.to_wire() > 0);

        assert_eq!(
            parts(16).pack(),
            Err(JobIdError::Overflow {
                field: "type_id",
                value: 16,
                bits: 4
            })
        );
        assert_eq!(pack_job_id(1, 1, 1, 16, 1), 0);
    }

    #[test]
    fn test_zero_fields_rejected() {
        assert_eq!(pack_job_id(0, 1, 1, 1, 1), 0);
        assert_eq!(pack_job_id(1, 1, 0, 1, 1), 0);
        assert!(JobId::from_raw(0).unpack().is_err());
        assert!(JobId::from_wire(-1).unpack().is_err());
    }

    #[test]
    fn test_field_positions() {
        let raw = pack_job_id(1, 1, 1, 1, 1);
        assert_eq!(raw, 1 | 1 << 24 | 1 << 41 | 1 << 50 | 1 << 54);
        let unpacked = JobId::from_wire(raw as i64).unpack().unwrap();
        assert_eq!(unpacked.type_session_idx, 1);
    }

    #[test]
    fn test_field_range_sweep() {
        let reqs = [1, 0x80_0000, 0xff_ffff];
        let sessions = [1, 0x1_0000, 0x1_ffff];
        let instances = [1, 0x100, 0x1ff];
        let types = [1u8, 8, 15];
        let type_sessions = [1, 0x100, 0x1ff];

        for req_id in reqs {
            for session_id in sessions {
                for instance_id in instances {
                    for type_id in types {
                        for type_session_idx in type_sessions {
                            let parts = JobIdParts {
                                req_id,
                                session_id,
                                instance_id,
                                type_id,
                                type_session_idx,
                            };
                            let id = parts.pack().unwrap();
                            assert!(id.to_wire() >= 0, "{parts:?}");
                            assert_eq!(id.unpack(), Ok(parts));
                            assert_eq!(JobId::from_wire(id.to_wire()).unpack(), Ok(parts));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_each_field_bounds() {
        let max = parts(15);
        let cases: [(&'static str, u32, fn(&mut JobIdParts, u32)); 5] = [
            ("req_id", 24, |p, v| p.req_id = v),
            ("session_id", 17, |p, v| p.session_id = v),
            ("instance_id", 9, |p, v| p.instance_id = v),
            ("type_id", 4, |p, v| p.type_id = v as u8),
            ("type_session_idx", 9, |p, v| p.type_session_idx = v),
        ];
        for (field, bits, set) in cases {
            let mut zero = max;
            set(&mut zero, 0);
            assert_eq!(zero.pack(), Err(JobIdError::ZeroField { field }));

            let over = (1u32 << bits) as u64;
            let mut wide = max;
            set(&mut wide, over as u32);
            assert_eq!(
                wide.pack(),
                Err(JobIdError::Overflow {
                    field,
                    value: over,
                    bits
                })
            );

            let mut top = max;
            set(&mut top, (over - 1) as u32);
            assert!(top.pack().is_ok(), "{field} at its maximum");
        }
    }

    #[test]
    fn test_class_handle_layout() {
        let h = pack_class_handle(100, 128, 42);
        assert_eq!(class_handle_session(h), 100);
        assert_eq!(class_handle_slot(h), 128);
        assert_eq!(h & MAX_HANDLE_SERIAL, 42);
        assert_eq!(class_handle_session(0), 0);
    }
}
