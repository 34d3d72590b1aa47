use std::sync::Arc;
use std::time::{Duration, Instant};

use zarch_irq::sys::config::SysConfig;
use zarch_irq::sys::console::{Console, ConsoleCmd};
use zarch_irq::sys::cpu::{CpuState, Processor};
use zarch_irq::sys::psa::Arch;
use zarch_irq::sys::psw::{Psw, PSW_EXT_MASK, PSW_IO_MASK};
use zarch_irq::sys::run::spawn_cpu;
use zarch_irq::sys::storage::{MainStorage, Storage, STORKEY_CHANGE, STORKEY_REF};
use zarch_irq::sys::timer::TodClock;
use zarch_irq::sys::{CpuMask, ProgramCheck, System};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn system(arch: Arch, n: usize, tod: TodClock) -> (Arc<System>, Arc<MainStorage>) {
    let config = SysConfig { num_cpus: n, arch, main_storage: 1 << 20, ..Default::default() };
    let storage = Arc::new(MainStorage::new(1 << 20));
    let sys = System::with_clock(config, Arc::clone(&storage) as Arc<dyn Storage>, tod).unwrap();
    (sys, storage)
}

fn sample_psw(arch: Arch) -> Psw {
    Psw {
        sysmask: PSW_EXT_MASK | PSW_IO_MASK,
        pkey: 3,
        cc: 2,
        ecmode: arch != Arch::S370,
        amode64: arch == Arch::ZArch,
        amode31: arch != Arch::S370,
        ia: 0x0012_3456,
        ..Default::default()
    }
}

fn populate(cpu: &mut Processor, tod: u64) {
    let narrow = !cpu.arch.is_64bit();
    for i in 0..16 {
        let v = 0x0101_0101_0101_0101u64.wrapping_mul(i as u64 + 1);
        cpu.gr[i] = if narrow { v & 0xFFFF_FFFF } else { v };
        cpu.cr[i] = if narrow { (v >> 8) & 0xFFFF_FFFF } else { v >> 8 };
        cpu.fpr[i] = v ^ 0xFFFF_0000_FFFF_0000;
        cpu.ar[i] = 0xA000 + i as u32;
    }
    cpu.fpc = 0x0008_0000;
    cpu.psw = sample_psw(cpu.arch);
    cpu.set_clkc(0x00AB_CDEF_0000_0000);
    cpu.set_cpu_timer(tod, 0x7_0000);
    cpu.set_ic_mask();
}

#[test]
fn test_status_round_trip_all_generations() {
    init_logger();
    const BASE: u64 = 0x20000;
    const TOD: u64 = 0x1234_5678_0000;

    for arch in [Arch::S370, Arch::Esa390, Arch::ZArch] {
        let (sys, storage) = system(arch, 2, TodClock::manual(TOD));
        let s = &arch.layout().status;

        let mut src = sys.processor(0).unwrap();
        populate(&mut src, TOD);
        sys.store_status(&src, BASE).unwrap();
        assert_eq!(storage.storage_key(BASE) & (STORKEY_REF | STORKEY_CHANGE), STORKEY_REF | STORKEY_CHANGE, "{arch}");

        let mut dst = sys.processor(1).unwrap();
        sys.load_status(&mut dst, BASE).unwrap();

        assert_eq!(dst.psw, src.psw, "{arch}");
        assert_eq!(dst.gr, src.gr, "{arch}");
        assert_eq!(dst.cr, src.cr, "{arch}");
        assert_eq!(dst.px, src.px, "{arch}");
        assert_eq!(dst.shared().clkc(), src.shared().clkc(), "{arch}");
        assert_eq!(dst.shared().cpu_timer(TOD), 0x7_0000, "{arch}");

        let fprs: &[usize] = match s.fpr_count {
            4 => &[0, 2, 4, 6],
            _ => &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
        };
        for &r in fprs {
            assert_eq!(dst.fpr[r], src.fpr[r], "{arch} FPR{r}");
        }
        if s.ar.is_some() {
            assert_eq!(dst.ar, src.ar, "{arch}");
        }
        if s.fpc.is_some() {
            assert_eq!(dst.fpc, src.fpc, "{arch}");
        }
    }
}

#[test]
fn test_load_status_rejects_invalid_psw() {
    init_logger();
    const BASE: u64 = 0x30000;
    let (sys, storage) = system(Arch::ZArch, 1, TodClock::manual(1));
    let mut cpu = sys.processor(0).unwrap();
    populate(&mut cpu, 1);
    sys.store_status(&cpu, BASE).unwrap();

    // z/Architecture PSWs must not have the EC bit set
    let psw_addr = BASE + Arch::ZArch.layout().status.psw;
    let mut b = [0; 1];
    storage.fetch(psw_addr + 1, &mut b).unwrap();
    storage.store(psw_addr + 1, &[b[0] | 0x08]).unwrap();

    let mut other = sys.processor(0).unwrap();
    let before = other.psw;
    assert_eq!(sys.load_status(&mut other, BASE), Err(ProgramCheck::SPECIFICATION));
    assert_eq!(other.psw, before);
    assert_eq!(other.gr, [0; 16]);
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(start.elapsed() < timeout, "condition not reached within {timeout:?}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_console_start_stop_running_cpus() {
    init_logger();
    let (sys, _) = system(Arch::ZArch, 3, TodClock::host());
    let handles: Vec<_> = (0..3u16)
        .map(|cpuad| spawn_cpu(Arc::clone(&sys), cpuad, |_: &System, _: &mut Processor| std::hint::spin_loop()).unwrap())
        .collect();
    let console = Console::spawn(Arc::clone(&sys)).unwrap();

    console.send(ConsoleCmd::parse("startall").unwrap()).unwrap();
    wait_until(Duration::from_secs(5), || console.status().is_some_and(|s| s.started == CpuMask(0b111)));
    assert!(sys.any_started());

    console.send(ConsoleCmd::parse("stopall").unwrap()).unwrap();
    wait_until(Duration::from_secs(5), || sys.all_stopped());
    let status = console.status().unwrap();
    assert_eq!(status.started, CpuMask::EMPTY);
    assert_eq!(status.states, [CpuState::Stopped; 3]);
    assert!(sys.cpus().iter().all(|c| c.opinterv()));

    // restart after a full stop
    console.send(ConsoleCmd::StartAll).unwrap();
    wait_until(Duration::from_secs(5), || console.status().is_some_and(|s| s.started == CpuMask(0b111)));

    console.close();
    sys.shutdown();
    for h in handles {
        h.join().unwrap();
    }
}
