//! task_struct field offset discovery
//!
//! The kernel programs walk `task_struct.real_parent` chains and compare
//! `tgid`s, but those offsets move between kernel builds. Instead of baking
//! them in, the offsets are read from the running kernel's BTF at startup
//! and written into the programs' global data before load.

use aya::Btf;
use aya_obj::btf::{BtfKind, BtfType};
use sshtrail_trace_common::TaskFieldOffsets;
use tracing::debug;

use crate::CaptureError;

pub fn task_field_offsets() -> Result<TaskFieldOffsets, CaptureError> {
    let btf = Btf::from_sys_fs().map_err(|e| CaptureError::Btf(e.to_string()))?;
    offsets_from_btf(&btf)
}

fn offsets_from_btf(btf: &Btf) -> Result<TaskFieldOffsets, CaptureError> {
    let type_id = btf
        .id_by_type_name_kind("task_struct", BtfKind::Struct)
        .map_err(|e| CaptureError::Btf(e.to_string()))?;
    let ty = btf
        .type_by_id(type_id)
        .map_err(|e| CaptureError::Btf(e.to_string()))?;

    let BtfType::Struct(task_struct) = ty else {
        return Err(CaptureError::Btf("task_struct is not a struct".into()));
    };

    let mut real_parent = None;
    let mut tgid = None;

    for member in &task_struct.members {
        let name = btf
            .string_at(member.name_offset)
            .map_err(|e| CaptureError::Btf(e.to_string()))?;
        // The low 24 bits hold the bit offset in both member encodings
        // (the high byte carries bitfield sizes when kind_flag is set)
        let byte_offset = (member.offset & 0x00ff_ffff) / 8;

        match name.as_ref() {
            "real_parent" => real_parent = Some(byte_offset),
            "tgid" => tgid = Some(byte_offset),
            _ => {}
        }
    }

    match (real_parent, tgid) {
        (Some(real_parent), Some(tgid)) => {
            debug!(real_parent, tgid, "discovered task_struct offsets");
            Ok(TaskFieldOffsets { real_parent, tgid })
        }
        _ => Err(CaptureError::Btf(
            "task_struct is missing real_parent/tgid members".into(),
        )),
    }
}
