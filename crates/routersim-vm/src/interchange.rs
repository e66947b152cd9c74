//! Moving the startup configuration between NVRAM and files.

use std::fs;
use std::path::{Path, PathBuf};

use crate::device::lock_device;
use crate::error::{Result, VmError};
use crate::instance::Instance;
use crate::platform::NVRAM_OBJECT;

impl Instance {
    /// Decodes the configuration currently stored in NVRAM.
    ///
    /// # Errors
    ///
    /// `MissingObject` if no NVRAM device is bound, `NoConfigData` if the
    /// region is blank or corrupt.
    pub fn extract_config_text(&self) -> Result<String> {
        let nvram = self
            .find_device(NVRAM_OBJECT)
            .ok_or_else(|| VmError::MissingObject(NVRAM_OBJECT.to_string()))?;
        let dev = lock_device(&nvram);
        let raw = dev
            .raw_bytes()
            .ok_or_else(|| VmError::NoConfigData("NVRAM has no backing bytes".to_string()))?;
        let region = raw.get(self.nvram_rom_space as usize..).ok_or_else(|| {
            VmError::NoConfigData(format!(
                "NVRAM ({} bytes) smaller than ROM monitor space ({} bytes)",
                raw.len(),
                self.nvram_rom_space
            ))
        })?;
        self.codec.extract(region)
    }

    /// Writes `text` into NVRAM behind the reserved header and syncs the
    /// device.
    ///
    /// # Errors
    ///
    /// `MissingObject` if no NVRAM device is bound, `NoConfigData` if the
    /// configuration does not fit.
    pub fn push_config_text(&mut self, text: &str) -> Result<()> {
        let nvram = self
            .find_device(NVRAM_OBJECT)
            .ok_or_else(|| VmError::MissingObject(NVRAM_OBJECT.to_string()))?;
        let rom_space = self.nvram_rom_space as usize;
        let mut dev = lock_device(&nvram);
        let raw = dev
            .raw_bytes_mut()
            .ok_or_else(|| VmError::NoConfigData("NVRAM is not writable".to_string()))?;
        let region = raw.get_mut(rom_space..).ok_or_else(|| {
            VmError::NoConfigData("NVRAM smaller than ROM monitor space".to_string())
        })?;

        let bytes = self.codec.push(text, region.len())?;
        region[..bytes.len()].copy_from_slice(&bytes);
        dev.sync()?;
        drop(dev);

        self.log(
            "NVRAM",
            &format!("pushed {} bytes of configuration", text.len()),
        );
        Ok(())
    }

    /// Extracts the NVRAM configuration into `dest`.
    pub fn extract_config(&self, dest: impl AsRef<Path>) -> Result<()> {
        let text = self.extract_config_text()?;
        fs::write(dest.as_ref(), &text)?;
        self.log(
            "NVRAM",
            &format!("configuration extracted to {}", dest.as_ref().display()),
        );
        Ok(())
    }

    /// Reads `src` and pushes it into NVRAM.
    pub fn push_config(&mut self, src: impl AsRef<Path>) -> Result<()> {
        let text = fs::read_to_string(src.as_ref())?;
        self.push_config_text(&text)
    }

    /// Saves the NVRAM configuration to the instance's `ios_cfg.txt` file
    /// and returns its path.
    pub fn ios_save_config(&self) -> Result<PathBuf> {
        let path = self.build_filename("ios_cfg.txt");
        self.extract_config(&path)?;
        Ok(path)
    }

    /// Sets the IOS image to boot.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless halted.
    pub fn set_ios_image(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.ensure_halted("change IOS image")?;
        let path = path.into();
        self.log("VM", &format!("IOS image set to {}", path.display()));
        self.ios_image = Some(path);
        Ok(())
    }

    /// Sets the configuration file pushed into NVRAM at every start.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless halted.
    pub fn set_ios_config(&mut self, path: impl Into<PathBuf>) -> Result<()> {
        self.ensure_halted("change IOS config")?;
        let path = path.into();
        self.log("VM", &format!("IOS config set to {}", path.display()));
        self.ios_config = Some(path);
        Ok(())
    }

    /// Clears the startup configuration file.
    pub fn unset_ios_config(&mut self) -> Result<()> {
        self.ensure_halted("unset IOS config")?;
        self.ios_config = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::device_ref;
    use crate::devices::MemoryDevice;
    use crate::instance::VmStatus;
    use crate::platform::MachineType;
    use crate::settings::SimSettings;
    use std::sync::Arc;

    const CONFIG: &str = "hostname R1\n!\nip domain-name lab\n!\nend\n";

    fn instance(dir: &Path, machine: MachineType) -> Instance {
        let mut vm = Instance::new(
            "R1",
            1,
            machine,
            Arc::new(SimSettings::in_dir(dir)),
        )
        .unwrap();
        vm.attach_device(device_ref(MemoryDevice::new("nvram", 128 * 1024)), 0x1E00_0000)
            .unwrap();
        vm
    }

    #[test]
    fn test_push_then_extract_file() {
        let dir = tempfile::tempdir().unwrap();
        for machine in MachineType::ALL {
            let mut vm = instance(dir.path(), machine);
            let src = dir.path().join("startup.txt");
            let dest = dir.path().join("out.txt");
            fs::write(&src, CONFIG).unwrap();

            vm.push_config(&src).unwrap();
            vm.extract_config(&dest).unwrap();
            assert_eq!(fs::read_to_string(&dest).unwrap(), CONFIG);
        }
    }

    #[test]
    fn test_reserved_space_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = instance(dir.path(), MachineType::C7200);
        {
            let nvram = vm.find_device("nvram").unwrap();
            let mut dev = lock_device(&nvram);
            dev.raw_bytes_mut().unwrap()[..2048].fill(0x5A);
        }

        vm.push_config_text(CONFIG).unwrap();

        let nvram = vm.find_device("nvram").unwrap();
        let dev = lock_device(&nvram);
        assert!(dev.raw_bytes().unwrap()[..2048].iter().all(|b| *b == 0x5A));
    }

    #[test]
    fn test_nvram_roundtrip_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = instance(dir.path(), MachineType::C3600);
        vm.push_config_text(CONFIG).unwrap();

        let before = {
            let nvram = vm.find_device("nvram").unwrap();
            let dev = lock_device(&nvram);
            dev.raw_bytes().unwrap().to_vec()
        };

        let file = dir.path().join("cfg.txt");
        vm.extract_config(&file).unwrap();
        vm.push_config(&file).unwrap();

        let nvram = vm.find_device("nvram").unwrap();
        let dev = lock_device(&nvram);
        assert_eq!(dev.raw_bytes().unwrap(), before.as_slice());
    }

    #[test]
    fn test_blank_nvram() {
        let dir = tempfile::tempdir().unwrap();
        let vm = instance(dir.path(), MachineType::C7200);
        assert!(matches!(
            vm.extract_config(dir.path().join("x.txt")),
            Err(VmError::NoConfigData(_))
        ));
        assert!(!dir.path().join("x.txt").exists());
    }

    #[test]
    fn test_missing_nvram() {
        let dir = tempfile::tempdir().unwrap();
        let vm = Instance::new(
            "R9",
            9,
            MachineType::C7200,
            Arc::new(SimSettings::in_dir(dir.path())),
        )
        .unwrap();
        assert!(matches!(
            vm.extract_config_text(),
            Err(VmError::MissingObject(_))
        ));
    }

    #[test]
    fn test_ios_save_config_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = instance(dir.path(), MachineType::C7200);
        vm.push_config_text(CONFIG).unwrap();

        let path = vm.ios_save_config().unwrap();
        assert_eq!(path, dir.path().join("c7200_R1_ios_cfg.txt"));
        assert_eq!(fs::read_to_string(path).unwrap(), CONFIG);
    }

    #[test]
    fn test_paths_locked_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut vm = instance(dir.path(), MachineType::C7200);
        vm.set_ios_image("/images/c7200.bin").unwrap();
        vm.set_ios_config("/cfg/r1.txt").unwrap();

        vm.status.set(VmStatus::Running);
        assert!(matches!(
            vm.set_ios_image("/images/other.bin"),
            Err(VmError::InvalidState(_))
        ));
        assert!(matches!(vm.unset_ios_config(), Err(VmError::InvalidState(_))));
        assert_eq!(vm.ios_image(), Some(Path::new("/images/c7200.bin")));
        vm.status.set(VmStatus::Halted);

        vm.unset_ios_config().unwrap();
        assert!(vm.ios_config().is_none());
    }
}
