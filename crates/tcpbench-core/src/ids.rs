//! Small newtype ids, standing in for the source's `tagged_integer<T, Tag, Default>`.
//! Rust's newtype pattern gives the same "can't mix up a buffer_id with a buffer_index"
//! safety without a phantom-tagged template; each one derives the handful of traits its
//! callers actually need instead of reaching for a generic tagged-integer abstraction.

macro_rules! id_type {
    ($name:ident, $repr:ty, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub $repr);

        impl $name {
            pub const fn new(v: $repr) -> Self {
                Self(v)
            }

            pub const fn get(self) -> $repr {
                self.0
            }
        }

        impl From<$repr> for $name {
            fn from(v: $repr) -> Self {
                Self(v)
            }
        }

        impl From<$name> for $repr {
            fn from(v: $name) -> Self {
                v.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(BufferId, u16, "Index into a ProvidedBufferPool's kernel-shared ring, `[0, buffer_count)`.");
id_type!(BufferIndex, u16, "Index into a RegisteredBufferPool's fixed-index free list.");
id_type!(GroupId, u16, "Provided-buffer-ring group id, passed as `buf_group` on `IOSQE_BUFFER_SELECT` ops.");
id_type!(WorkerId, usize, "Ordinal of a worker thread, used for round-robin accept dispatch.");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let id = BufferId::new(7);
        assert_eq!(id.get(), 7);
        assert_eq!(u16::from(id), 7);
        assert_eq!(format!("{id}"), "7");
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(BufferId::new(1) < BufferId::new(2));
    }
}
