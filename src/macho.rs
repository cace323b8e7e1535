use crate::error::{CirclefyError, Result};
use goblin::mach::load_command::CommandVariant;
use goblin::mach::Mach;
use goblin::mach::MachO as GoblinMachO;
use std::fs;
use std::path::Path;

/// `build_version_command.platform` sits after `cmd` and `cmdsize`.
const PLATFORM_FIELD_OFFSET: usize = 8;

/// Location of one `platform` field inside the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlatformSlot {
    offset: usize,
    little_endian: bool,
    current: u32,
}

/// Rewrites the `platform` field of every `LC_BUILD_VERSION` command in every
/// slice of the Mach-O at `path`. Returns how many commands were rewritten.
pub fn set_platform<P: AsRef<Path>>(path: P, platform: u32) -> Result<usize> {
    let path = path.as_ref();
    let mut data = fs::read(path)?;

    let slots = find_platform_slots(&data)?;
    if slots.is_empty() {
        return Err(CirclefyError::MachO(
            "no LC_BUILD_VERSION load command found".to_string(),
        ));
    }

    for slot in &slots {
        let bytes = if slot.little_endian {
            platform.to_le_bytes()
        } else {
            platform.to_be_bytes()
        };
        data[slot.offset..slot.offset + 4].copy_from_slice(&bytes);
        tracing::debug!(
            offset = slot.offset,
            from = slot.current,
            to = platform,
            "rewrote build version platform"
        );
    }

    fs::write(path, &data)?;
    Ok(slots.len())
}

/// Platform codes currently recorded in the binary, one per `LC_BUILD_VERSION`.
pub fn read_platforms<P: AsRef<Path>>(path: P) -> Result<Vec<u32>> {
    let data = fs::read(path.as_ref())?;
    Ok(find_platform_slots(&data)?
        .into_iter()
        .map(|slot| slot.current)
        .collect())
}

fn find_platform_slots(data: &[u8]) -> Result<Vec<PlatformSlot>> {
    let mach = Mach::parse(data)
        .map_err(|e| CirclefyError::MachO(format!("not a Mach-O binary: {}", e)))?;

    let mut slots = Vec::new();
    match mach {
        Mach::Binary(macho) => collect_slots(&macho, 0, &mut slots),
        Mach::Fat(fat) => {
            for arch in fat.iter_arches() {
                let arch = arch?;
                let start = arch.offset as usize;
                let end = start + arch.size as usize;
                if end > data.len() {
                    return Err(CirclefyError::MachO(format!(
                        "fat slice {}..{} exceeds file size {}",
                        start,
                        end,
                        data.len()
                    )));
                }
                let macho = GoblinMachO::parse(&data[start..end], 0)?;
                collect_slots(&macho, start, &mut slots);
            }
        }
    }
    Ok(slots)
}

fn collect_slots(macho: &GoblinMachO, base_offset: usize, slots: &mut Vec<PlatformSlot>) {
    for load_cmd in &macho.load_commands {
        if let CommandVariant::BuildVersion(build) = &load_cmd.command {
            slots.push(PlatformSlot {
                offset: base_offset + load_cmd.offset + PLATFORM_FIELD_OFFSET,
                little_endian: macho.little_endian,
                current: build.platform,
            });
        }
    }
}
