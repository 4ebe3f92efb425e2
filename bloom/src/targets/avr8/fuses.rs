//! AVR8 fuse-bit management.
//!
//! Fuses control the target's debug capability itself, so every update runs a
//! sequence of safety checks before anything is written: signature
//! confirmation, an axiom-fuse check (a fuse whose state is forced by the act
//! of connection - SPIEN over ISP, JTAGEN over JTAG), a lock-bit check where
//! applicable, and a desired-value check. A failed check aborts the operation
//! without writing.

use bloom_target::{BitField, FuseEnableStrategy, FuseValue, PhysicalInterface};

use crate::error::Error;

use super::Avr8;

impl Avr8 {
    /// Whether `value` has the fuse selected by `bit_field` in its enabled
    /// state, per the descriptor's fuse enable strategy.
    pub(super) fn fuse_enabled(&self, bit_field: &BitField, value: FuseValue) -> bool {
        let mask = bit_field.mask as FuseValue;
        let programmed_value = match self.fuse_enable_strategy {
            FuseEnableStrategy::Set => mask,
            FuseEnableStrategy::Clear => 0,
        };

        (value & mask) == programmed_value
    }

    /// Computes the fuse byte with the fuse selected by `bit_field` set to
    /// `enabled`.
    pub(super) fn set_fuse_enabled(
        &self,
        bit_field: &BitField,
        value: FuseValue,
        enabled: bool,
    ) -> FuseValue {
        let mask = bit_field.mask as FuseValue;
        match (self.fuse_enable_strategy, enabled) {
            (FuseEnableStrategy::Set, true) | (FuseEnableStrategy::Clear, false) => value | mask,
            (FuseEnableStrategy::Set, false) | (FuseEnableStrategy::Clear, true) => value & !mask,
        }
    }

    /// Updates the DWEN fuse bit via the ISP interface.
    ///
    /// An incorrect fuse write can render the target inaccessible to standard
    /// programmers, and the description data the write is computed from
    /// carries no guarantee of correctness. Before writing, we confirm the
    /// target signature, confirm the SPIEN axiom fuse reads as programmed
    /// (we could not be talking over ISP otherwise - if it reads cleared, the
    /// descriptor data is distrusted and the operation aborts) and confirm
    /// all lock bits are cleared.
    pub(super) fn update_dwen_fuse_bit(&mut self, enable: bool) -> Result<(), Error> {
        if self.isp_interface.is_none() {
            return Err(Error::Unsupported(
                "the debug tool (or associated driver) does not provide access to an ISP \
                 interface"
                    .to_owned(),
            ));
        }

        if !self.descriptor.physical_interfaces.contains(&PhysicalInterface::DebugWire) {
            return Err(Error::Unsupported(
                "target does not support the debugWIRE physical interface".to_owned(),
            ));
        }

        let descriptor = self.descriptor.clone();
        let (dwen_register, dwen_field) = descriptor.fuse_register_bit_field_pair("dwen")?;
        let (spien_register, spien_field) = descriptor.fuse_register_bit_field_pair("spien")?;

        tracing::info!("Initiating ISP interface");
        self.isp_interface.as_mut().unwrap().activate()?;

        tracing::warn!(
            "Updating the DWEN fuse bit is a potentially dangerous operation. Bloom is provided \
             \"AS IS\", without warranty of any kind. You are using Bloom at your own risk."
        );

        let result = (|| {
            let isp = self.isp_interface.as_mut().unwrap();

            tracing::info!("Reading target signature via ISP");
            let signature = isp.device_signature()?;

            if signature != descriptor.signature {
                return Err(Error::FuseSafetyCheckFailed(format!(
                    "target signature mismatch - expected \"{}\" but got \"{}\". Please check \
                     the target configuration",
                    descriptor.signature.to_hex(),
                    signature.to_hex()
                )));
            }

            tracing::info!("Target signature confirmed: {}", signature.to_hex());

            let dwen_fuse_byte = isp.read_fuse(dwen_register)?;
            let spien_fuse_byte = if spien_register == dwen_register {
                dwen_fuse_byte
            } else {
                isp.read_fuse(spien_register)?
            };

            if !self.fuse_enabled(spien_field, spien_fuse_byte) {
                // We are connected over SPI, so SPIEN cannot really be
                // cleared. The descriptor's SPIEN data must be wrong - and
                // then its DWEN data cannot be trusted either.
                return Err(Error::FuseSafetyCheckFailed(
                    "invalid SPIEN fuse bit value - suspected inaccuracies in the target \
                     description data"
                        .to_owned(),
                ));
            }

            tracing::info!("Current SPIEN fuse bit value confirmed");

            if self.fuse_enabled(dwen_field, dwen_fuse_byte) == enable {
                // Possibly correct, possibly bad descriptor data. Either way,
                // nothing to write.
                tracing::debug!("DWEN fuse bit already set to desired value - aborting update");
                return Ok(());
            }

            let isp = self.isp_interface.as_mut().unwrap();
            let lock_bit_byte = isp.read_lock_bit_byte()?;
            if lock_bit_byte != 0xFF {
                return Err(Error::FuseSafetyCheckFailed(
                    "at least one lock bit has been set - updating the DWEN fuse bit could \
                     potentially brick the target"
                        .to_owned(),
                ));
            }

            tracing::info!("Cleared lock bits confirmed");

            let new_value = self.set_fuse_enabled(dwen_field, dwen_fuse_byte, enable);

            tracing::warn!("Updating DWEN fuse bit");
            let isp = self.isp_interface.as_mut().unwrap();
            isp.program_fuse(dwen_register, new_value)?;

            tracing::debug!("Verifying DWEN fuse bit");
            if isp.read_fuse(dwen_register)? != new_value {
                return Err(Error::TargetOperationFailure(
                    "failed to update DWEN fuse bit - post-update verification failed".to_owned(),
                ));
            }

            tracing::info!("DWEN fuse bit successfully updated");
            Ok(())
        })();

        // The ISP interface is released regardless of the outcome.
        if let Err(error) = self.isp_interface.as_mut().unwrap().deactivate() {
            tracing::error!("Failed to deactivate ISP interface - {error}");
        }

        result
    }

    /// Updates the OCDEN fuse bit via the JTAG debug interface, with JTAGEN
    /// as the axiom fuse.
    pub(super) fn update_ocden_fuse_bit(&mut self, enable: bool) -> Result<(), Error> {
        if !self.descriptor.physical_interfaces.contains(&PhysicalInterface::Jtag) {
            return Err(Error::Unsupported(
                "target does not support the JTAG physical interface".to_owned(),
            ));
        }

        let descriptor = self.descriptor.clone();

        let signature = self.debug_interface.device_signature()?;
        if signature != descriptor.signature {
            return Err(Error::FuseSafetyCheckFailed(format!(
                "target signature mismatch - expected \"{}\" but got \"{}\"",
                descriptor.signature.to_hex(),
                signature.to_hex()
            )));
        }

        let (ocden_register, ocden_field) = descriptor.fuse_register_bit_field_pair("ocden")?;
        let (jtagen_register, jtagen_field) = descriptor.fuse_register_bit_field_pair("jtagen")?;

        let ocden_fuse_byte = self.read_register(ocden_register)?[0];
        let jtagen_fuse_byte = if jtagen_register == ocden_register {
            ocden_fuse_byte
        } else {
            self.read_register(jtagen_register)?[0]
        };

        tracing::debug!("OCDEN fuse byte value (before update): 0x{ocden_fuse_byte:02x}");

        if !self.fuse_enabled(jtagen_field, jtagen_fuse_byte) {
            // JTAGEN must be programmed for the JTAG interface to have
            // activated at all. The descriptor data is distrusted.
            return Err(Error::FuseSafetyCheckFailed(
                "invalid JTAGEN fuse bit value - suspected inaccuracies in the target \
                 description data"
                    .to_owned(),
            ));
        }

        if self.fuse_enabled(ocden_field, ocden_fuse_byte) == enable {
            tracing::debug!("OCDEN fuse bit already set to desired value - aborting update");
            return Ok(());
        }

        let new_value = self.set_fuse_enabled(ocden_field, ocden_fuse_byte, enable);
        tracing::debug!("New OCDEN fuse byte value (to be written): 0x{new_value:02x}");

        tracing::warn!("Updating OCDEN fuse bit");
        self.write_register(ocden_register, &[new_value])?;

        tracing::debug!("Verifying OCDEN fuse bit");
        if self.read_register(ocden_register)?[0] != new_value {
            return Err(Error::TargetOperationFailure(
                "failed to update OCDEN fuse bit - post-update verification failed".to_owned(),
            ));
        }

        tracing::info!("OCDEN fuse bit updated");
        Ok(())
    }

    /// Updates the EESAVE fuse bit via the debug interface. Returns true when
    /// the fuse was actually changed (and must therefore be restored at the
    /// end of the programming session).
    pub(super) fn update_eesave_fuse_bit(&mut self, enable: bool) -> Result<bool, Error> {
        let descriptor = self.descriptor.clone();
        let (eesave_register, eesave_field) = descriptor.fuse_register_bit_field_pair("eesave")?;

        let eesave_fuse_byte = self.read_register(eesave_register)?[0];
        tracing::debug!("EESAVE fuse byte value (before update): 0x{eesave_fuse_byte:02x}");

        if self.fuse_enabled(eesave_field, eesave_fuse_byte) == enable {
            tracing::debug!("EESAVE fuse bit already set to desired value - aborting update");
            return Ok(false);
        }

        let new_value = self.set_fuse_enabled(eesave_field, eesave_fuse_byte, enable);
        tracing::debug!("New EESAVE fuse byte value (to be written): 0x{new_value:02x}");

        tracing::warn!("Updating EESAVE fuse bit");
        self.write_register(eesave_register, &[new_value])?;

        tracing::debug!("Verifying EESAVE fuse bit");
        if self.read_register(eesave_register)?[0] != new_value {
            return Err(Error::TargetOperationFailure(
                "failed to update EESAVE fuse bit - post-update verification failed".to_owned(),
            ));
        }

        tracing::info!("EESAVE fuse bit updated");
        Ok(true)
    }

    /// Cycles target power via the tool's power interface, if one exists.
    pub(super) fn cycle_target_power(&mut self) -> Result<(), Error> {
        let Some(power) = self.power_interface.as_mut() else {
            return Ok(());
        };

        let delay = std::time::Duration::from_millis(self.config.target_power_cycle_delay_ms);

        tracing::info!("Cycling target power");

        tracing::debug!("Disabling target power");
        power.disable_target_power()?;

        tracing::debug!("Holding power off for ~{} ms", delay.as_millis());
        std::thread::sleep(delay);

        tracing::debug!("Enabling target power");
        power.enable_target_power()?;

        tracing::debug!("Waiting ~{} ms for target power-up", delay.as_millis());
        std::thread::sleep(delay);

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use bloom_target::BitField;

    use crate::config::TargetConfig;
    use crate::targets::TargetRegistry;
    use crate::tools::simulator::SimulatedTool;
    use crate::tools::DebugTool;

    use super::super::Avr8;

    fn target_config() -> TargetConfig {
        let raw = r#"
name: "atmega328p"
physical_interface: "debug_wire"
"#;
        serde_yaml::from_str(raw).unwrap()
    }

    fn adapter() -> Avr8 {
        let registry = TargetRegistry::new();
        let descriptor = registry.descriptor("atmega328p").unwrap();
        let mut tool: Box<dyn DebugTool> = Box::new(SimulatedTool::new());
        tool.init().unwrap();
        Avr8::new(descriptor, &target_config(), tool.as_mut()).unwrap()
    }

    fn field(mask: u64) -> BitField {
        BitField { key: "dwen".to_owned(), name: "DWEN".to_owned(), mask }
    }

    #[test]
    fn fuse_enabled_with_clear_strategy() {
        let adapter = adapter();

        // Clear strategy: a cleared bit means the fuse is programmed.
        assert!(adapter.fuse_enabled(&field(0x40), 0b1001_1001));
        assert!(!adapter.fuse_enabled(&field(0x40), 0b1101_1001));
    }

    #[test]
    fn set_fuse_enabled_flips_only_the_masked_bit() {
        let adapter = adapter();

        assert_eq!(adapter.set_fuse_enabled(&field(0x40), 0xD9, true), 0x99);
        assert_eq!(adapter.set_fuse_enabled(&field(0x40), 0x99, false), 0xD9);
        // Re-applying the current polarity is a no-op.
        assert_eq!(adapter.set_fuse_enabled(&field(0x40), 0x99, true), 0x99);
    }
}
