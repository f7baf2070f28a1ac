use bitflags::bitflags;

bitflags! {
    /// Method attribute bits carried by `DeclareMethod`.
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct MethodFlags: u8 {
        /// The method has no `this` argument.
        const STATIC = 0x01;
        /// The method participates in virtual dispatch.
        const VIRTUAL = 0x02;
        /// The body is not IL but a native-method tag.
        const SPECIAL = 0x04;
        /// The method returns no value.
        const VOID = 0x08;
        /// The method is an instance constructor.
        const CTOR = 0x10;
        /// The method has no body at all; calling it resolves to an
        /// override or fails.
        const ABSTRACT = 0x20;
    }
}

bitflags! {
    /// Startup behavior bits stored in the flash header.
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct StartupFlags: u32 {
        /// Seed a root frame for the startup token on boot.
        const AUTO_START = 0x01;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_from_wire_bits() {
        let flags = MethodFlags::from_bits_truncate(0x09);
        assert!(flags.contains(MethodFlags::STATIC));
        assert!(flags.contains(MethodFlags::VOID));
        assert!(!flags.contains(MethodFlags::VIRTUAL));
    }
}
