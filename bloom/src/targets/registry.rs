use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;

use bloom_target::TargetDescriptor;

use crate::error::Error;

/// The target description bundles baked into the binary, parsed and
/// validated once per process.
static BUILTIN_DESCRIPTORS: Lazy<Vec<Arc<TargetDescriptor>>> = Lazy::new(|| {
    [
        include_str!("../../targets/atmega328p.yaml"),
        include_str!("../../targets/ch32v003.yaml"),
    ]
    .iter()
    .map(|raw| {
        let descriptor: TargetDescriptor = serde_yaml::from_str(raw)
            .expect("builtin target description bundle failed to parse");
        descriptor.validate().expect("builtin target description bundle failed validation");
        Arc::new(descriptor)
    })
    .collect()
});

/// Maps configuration target names to their description bundles.
///
/// New registries start with the built-in bundles; additional bundles can be
/// registered at runtime.
pub struct TargetRegistry {
    descriptors: BTreeMap<String, Arc<TargetDescriptor>>,
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self {
            descriptors: BUILTIN_DESCRIPTORS
                .iter()
                .map(|descriptor| (descriptor.name.clone(), descriptor.clone()))
                .collect(),
        }
    }
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an externally supplied description bundle, after validating
    /// it. Replaces any existing bundle of the same name.
    pub fn register(&mut self, descriptor: TargetDescriptor) -> Result<(), Error> {
        descriptor.validate()?;
        self.descriptors.insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    /// True if `name` maps to a known target.
    pub fn contains(&self, name: &str) -> bool {
        self.descriptors.contains_key(name)
    }

    /// Resolves a target description bundle by target name.
    pub fn descriptor(&self, name: &str) -> Result<Arc<TargetDescriptor>, Error> {
        self.descriptors.get(name).cloned().ok_or_else(|| {
            Error::InvalidConfig(format!(
                "target name (\"{name}\") not recognised - please check your configuration"
            ))
        })
    }
}

#[cfg(test)]
mod test {
    use bloom_target::TargetFamily;

    use super::*;

    #[test]
    fn builtin_bundles_parse_and_validate() {
        let registry = TargetRegistry::new();

        let avr = registry.descriptor("atmega328p").unwrap();
        assert_eq!(avr.family, TargetFamily::Avr8);
        assert_eq!(avr.signature.to_hex(), "1e950f");
        avr.address_space("prog").unwrap().segment("internal_program_memory").unwrap();

        let wch = registry.descriptor("ch32v003").unwrap();
        assert_eq!(wch.family, TargetFamily::WchRiscV);
        let sys = wch.address_space("sys").unwrap();
        assert!(sys.segment("boot_program").unwrap().size() < sys.segment("main_program").unwrap().size());
    }

    #[test]
    fn builtin_bundles_are_parsed_once_and_shared() {
        let first = TargetRegistry::new().descriptor("atmega328p").unwrap();
        let second = TargetRegistry::new().descriptor("atmega328p").unwrap();

        // Registries share the process-wide parsed bundle.
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn fuse_bit_field_lookups_resolve() {
        let registry = TargetRegistry::new();
        let avr = registry.descriptor("atmega328p").unwrap();

        let (register, field) = avr.fuse_register_bit_field_pair("dwen").unwrap();
        assert_eq!(register.key, "high");
        assert_eq!(field.mask, 0x40);

        let (register, field) = avr.fuse_register_bit_field_pair("spien").unwrap();
        assert_eq!(register.key, "high");
        assert_eq!(field.mask, 0x20);
    }

    #[test]
    fn unknown_target_name_is_invalid_config() {
        let registry = TargetRegistry::new();
        assert!(matches!(registry.descriptor("attiny85"), Err(Error::InvalidConfig(_))));
    }
}
