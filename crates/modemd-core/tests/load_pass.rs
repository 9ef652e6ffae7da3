//! Full load passes against board-shaped directories.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use modemd_core::config::ModemTopology;
use modemd_core::hw::HwSync;
use modemd_core::hw::sync::RemoteFlags;
use modemd_core::load::nv::NvHeader;
use modemd_core::load::{
    FlagBitmask, LoadTargets, ModemType, PartitionEntry, PartitionTable, Subsystem, TableSet,
};
use modemd_core::props::{self, PropertyStore};
use modemd_core::state::ModemState;
use modemd_core::test_util::{Harness, HwCall, RecordingHwSync};

fn nv_image(payload: &[u8]) -> Vec<u8> {
    let mut v = NvHeader::sector_for(payload, 1);
    v.extend_from_slice(payload);
    v
}

fn touch(path: &Path) {
    fs::write(path, b"").unwrap();
}

#[test]
fn internal_td_board_loads_images_cmdline_and_nv() {
    let h = Harness::new();
    let part = h.path("part");
    let cptl = h.path("cptl");
    fs::create_dir_all(&part).unwrap();
    fs::create_dir_all(&cptl).unwrap();

    h.props.set(props::PARTITION_PATH, &format!("{}/", part.display()));
    h.props.set(props::NV_PARTITION, "l_");
    h.props.set(props::MODEM_DEV, &format!("{}/", cptl.display()));

    fs::write(
        &h.ctx.config.paths.cmdline,
        "console=ttyS1 modem=shutdown androidboot.mode=normal lcd=id\n",
    )
    .unwrap();
    fs::write(part.join("l_modem"), b"cp firmware image").unwrap();
    fs::write(part.join("l_dsp"), b"dsp firmware").unwrap();

    let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    let good = nv_image(&payload);
    let mut damaged = good.clone();
    let last = damaged.len() - 1;
    damaged[last] ^= 0xff;
    fs::write(part.join("l_fixnv1"), &good).unwrap();
    fs::write(part.join("l_fixnv2"), &damaged).unwrap();

    for name in ["start", "stop", "modem", "dsp", "cpcmdline", "fixnv", "runnv"] {
        touch(&cptl.join(name));
    }

    let tables = TableSet::probe(&h.ctx.config, h.props.as_ref(), ModemType::Td);
    assert!(tables.cp.usable());
    assert!(!tables.sp.usable(), "board has no companion loader");
    let loader = h.loader_with(tables);

    // The runtime NV banks are missing; that is logged, not fatal.
    loader.load(LoadTargets::MODEM).unwrap();

    assert_eq!(h.ctx.state.get(), ModemState::Booting);
    assert_eq!(fs::read(cptl.join("modem")).unwrap(), b"cp firmware image");
    assert_eq!(fs::read(cptl.join("dsp")).unwrap(), b"dsp firmware");
    assert_eq!(
        fs::read(cptl.join("cpcmdline")).unwrap(),
        b"androidboot.mode=normal lcd=id\0"
    );
    assert_eq!(fs::read(cptl.join("fixnv")).unwrap(), payload);
    assert_eq!(
        fs::read(part.join("l_fixnv2")).unwrap(),
        good,
        "damaged backup repaired from primary"
    );
    assert_eq!(fs::read(cptl.join("stop")).unwrap(), b"1");
    assert_eq!(fs::read(cptl.join("start")).unwrap(), b"1");
}

fn external_table(h: &Harness, ctl: Arc<RecordingHwSync>) -> PartitionTable {
    let stages = [
        ("spl", FlagBitmask::SPL),
        ("uboot", FlagBitmask::UBOOT),
        ("boot", FlagBitmask::BOOT),
        ("modem_head", FlagBitmask::MODEM_HEAD),
        ("modem", FlagBitmask::MODEM),
    ];
    let mut table = PartitionTable::empty(Subsystem::Cp);
    table.externally_described = true;
    table.ioctl = Some(ctl as Arc<dyn HwSync>);
    for (name, flags) in stages {
        let src = h.path(&format!("src_{name}"));
        fs::write(&src, name.as_bytes()).unwrap();
        table.entries.push(PartitionEntry {
            name: name.into(),
            read_path: src,
            write_path: h.path(&format!("dst_{name}")),
            address: 0,
            size: 64,
            flags,
        });
    }
    table
}

fn tables_with_cp(cp: PartitionTable) -> TableSet {
    TableSet {
        cp,
        sp: PartitionTable::empty(Subsystem::Sp),
        dp: PartitionTable::empty(Subsystem::Dp),
    }
}

#[test]
fn external_miniap_boot_walks_the_handshake() {
    let h = Harness::with_config(|c| c.daemon.topology = ModemTopology::External);
    let ctl = RecordingHwSync::new(&h.path("mcd"));
    touch(&h.path("mcd"));
    ctl.respond(RemoteFlags::SPL_DONE, RemoteFlags::DDR_READY);
    let loader = h.loader_with(tables_with_cp(external_table(&h, Arc::clone(&ctl))));

    loader
        .load(LoadTargets::MINIAP | LoadTargets::MODEM)
        .unwrap();
    assert_eq!(h.ctx.state.get(), ModemState::Booting);

    let raised: Vec<RemoteFlags> = ctl
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            HwCall::SetRemote(f) if !f.is_empty() => Some(f),
            _ => None,
        })
        .collect();
    assert_eq!(
        raised,
        vec![
            RemoteFlags::SPL_DONE,
            RemoteFlags::UBOOT_DONE,
            RemoteFlags::BOOT_DONE,
            RemoteFlags::HEAD_DONE,
            RemoteFlags::MODEM_IMAGE_DONE,
        ]
    );
    let calls = ctl.calls();
    let stop = calls.iter().position(|c| *c == HwCall::Stop).unwrap();
    let start = calls.iter().rposition(|c| *c == HwCall::Start).unwrap();
    assert!(stop < start, "cp stopped before loading and started after");
}

#[test]
fn external_boot_gives_up_without_ddr_ready() {
    let h = Harness::with_config(|c| c.daemon.topology = ModemTopology::External);
    let ctl = RecordingHwSync::new(&h.path("mcd"));
    touch(&h.path("mcd"));
    let loader = h.loader_with(tables_with_cp(external_table(&h, Arc::clone(&ctl))));

    assert!(loader.load(LoadTargets::ALL_EXTERNAL).is_err());
    assert_eq!(h.ctx.state.get(), ModemState::Loading);
    assert!(
        !ctl.calls().contains(&HwCall::SetRemote(RemoteFlags::UBOOT_DONE)),
        "later stages never attempted"
    );
}
