mod common;

use common::{Machine, TestHost, user_write};
use kernel_memory_addresses::VirtualAddress;
use kernel_mm::{CloneFlags, FaultOutcome, Placement, Resolution, VmError, VmFlags};
use kernel_vmem::{Paging, X86, X86_64};

const PAGES: u64 = 3;

fn fork_shares_pages_read_only<P: Paging>() {
    let mut m = Machine::<P>::new(256);
    let mut parent = m.space();
    let base = parent
        .mmap(Placement::Anywhere, PAGES * 0x1000, VmFlags::rw(), None, &mut m.frames, &m.tlb)
        .unwrap()
        .as_u64();
    for i in 0..PAGES {
        m.store(&parent, base + i * 0x1000, 0x40 + i as u8);
    }
    let before = m.used();

    let child = parent
        .fork(CloneFlags::new(), &m.kernel, &mut m.frames, &m.tlb)
        .unwrap();
    assert!(child.directory().shares_kernel_half(&m.frames, &m.kernel));

    for i in 0..PAGES {
        let va = VirtualAddress::new(base + i * 0x1000);
        let p = parent.directory().entry_test(&m.frames, va).unwrap();
        let c = child.directory().entry_test(&m.frames, va).unwrap();
        assert!(!p.writable() && !c.writable());
        assert_eq!(p.physical_address(), c.physical_address());
        assert_eq!(m.refcount_at(&parent, va.as_u64()), 2);
        assert_eq!(m.peek(&child, va.as_u64()), 0x40 + i as u8);
    }
    // Only the child's tables, root and kernel stack are new.
    assert!(m.used() > before);
    assert_eq!(child.vmas().len(), parent.vmas().len());

    child.destroy(&mut m.frames, &m.tlb);
    parent.destroy(&mut m.frames, &m.tlb);
}

#[test]
fn x86_fork_shares_pages_read_only() {
    fork_shares_pages_read_only::<X86>();
}

#[test]
fn x86_64_fork_shares_pages_read_only() {
    fork_shares_pages_read_only::<X86_64>();
}

fn write_after_fork_copies_once<P: Paging>() {
    let mut m = Machine::<P>::new(256);
    let mut parent = m.space();
    let va = parent
        .mmap(Placement::Anywhere, 0x1000, VmFlags::rw(), None, &mut m.frames, &m.tlb)
        .unwrap()
        .as_u64();
    m.store(&parent, va, 7);
    let child = parent
        .fork(CloneFlags::new(), &m.kernel, &mut m.frames, &m.tlb)
        .unwrap();

    // Parent writes first: exactly one new frame, only the parent gets it.
    let used = m.used();
    let mut host = TestHost::default();
    let outcome = m.fault(&parent, &mut host, va, user_write().with_present(true));
    assert_eq!(outcome, FaultOutcome::Resolved(Resolution::CopyOnWrite));
    assert_eq!(m.used(), used + 1);
    assert_eq!(m.tlb.last_page(), VirtualAddress::new(va));

    let p = parent.directory().entry_test(&m.frames, VirtualAddress::new(va)).unwrap();
    let c = child.directory().entry_test(&m.frames, VirtualAddress::new(va)).unwrap();
    assert!(p.writable());
    assert!(!c.writable());
    assert_ne!(p.physical_address(), c.physical_address());
    assert_eq!(m.refcount_at(&parent, va), 1);
    assert_eq!(m.refcount_at(&child, va), 1);
    assert_eq!(m.peek(&parent, va), 7);

    m.poke(&parent, va, 9);
    assert_eq!(m.peek(&child, va), 7);

    // Child is now the last sharer: write access comes back without a copy.
    let used = m.used();
    let outcome = m.fault(&child, &mut host, va, user_write().with_present(true));
    assert_eq!(outcome, FaultOutcome::Resolved(Resolution::Reclaimed));
    assert_eq!(m.used(), used);
    assert!(child.directory().entry_test(&m.frames, VirtualAddress::new(va)).unwrap().writable());
    assert!(host.signals.is_empty());

    child.destroy(&mut m.frames, &m.tlb);
    parent.destroy(&mut m.frames, &m.tlb);
}

#[test]
fn x86_write_after_fork_copies_once() {
    write_after_fork_copies_once::<X86>();
}

#[test]
fn x86_64_write_after_fork_copies_once() {
    write_after_fork_copies_once::<X86_64>();
}

#[test]
fn child_write_leaves_parent_read_only() {
    let mut m = Machine::<X86_64>::new(256);
    let mut parent = m.space();
    let va = parent
        .mmap(Placement::Anywhere, 0x1000, VmFlags::rw(), None, &mut m.frames, &m.tlb)
        .unwrap()
        .as_u64();
    m.store(&parent, va, 1);
    let child = parent
        .fork(CloneFlags::new(), &m.kernel, &mut m.frames, &m.tlb)
        .unwrap();

    m.store(&child, va, 2);
    assert_eq!(m.peek(&parent, va), 1);
    assert_eq!(m.peek(&child, va), 2);
    assert!(!parent.directory().entry_test(&m.frames, VirtualAddress::new(va)).unwrap().writable());

    child.destroy(&mut m.frames, &m.tlb);
    parent.destroy(&mut m.frames, &m.tlb);
}

#[test]
fn shared_mappings_stay_writable_across_fork() {
    let mut m = Machine::<X86>::new(128);
    let mut parent = m.space();
    let flags = VmFlags::rw().with_shared(true);
    let va = parent
        .mmap(Placement::Anywhere, 0x1000, flags, None, &mut m.frames, &m.tlb)
        .unwrap()
        .as_u64();
    m.store(&parent, va, 3);
    let child = parent
        .fork(CloneFlags::new(), &m.kernel, &mut m.frames, &m.tlb)
        .unwrap();

    assert!(child.directory().entry_test(&m.frames, VirtualAddress::new(va)).unwrap().writable());
    m.poke(&child, va, 4);
    assert_eq!(m.peek(&parent, va), 4);
    assert_eq!(m.refcount_at(&parent, va), 2);

    child.destroy(&mut m.frames, &m.tlb);
    assert_eq!(m.refcount_at(&parent, va), 1);
    parent.destroy(&mut m.frames, &m.tlb);
}

#[test]
fn sharing_the_whole_address_space_is_unsupported() {
    let mut m = Machine::<X86_64>::new(64);
    let parent = m.space();
    let used = m.used();
    let err = parent
        .fork(CloneFlags::new().with_share_vm(true), &m.kernel, &mut m.frames, &m.tlb)
        .unwrap_err();
    assert_eq!(err, VmError::Unsupported);
    assert_eq!(m.used(), used);
    parent.destroy(&mut m.frames, &m.tlb);
}

#[test]
fn failed_fork_releases_the_partial_child() {
    // Enough for the parent's pages but not for a second set of tables.
    let mut m = Machine::<X86_64>::new(24);
    let mut parent = m.space();
    let va = parent
        .mmap(Placement::Anywhere, 0x1000, VmFlags::rw(), None, &mut m.frames, &m.tlb)
        .unwrap()
        .as_u64();
    m.store(&parent, va, 5);
    while m.frames.stats().free > 4 {
        let _ = m
            .frames
            .allocate(1, kernel_alloc::Contiguity::Discontiguous, kernel_alloc::AllocFlags::new())
            .unwrap();
    }
    let used = m.used();

    let err = parent
        .fork(CloneFlags::new(), &m.kernel, &mut m.frames, &m.tlb)
        .unwrap_err();
    assert!(matches!(err, VmError::Map(_)), "{err:?}");
    assert_eq!(m.used(), used);
    assert_eq!(m.refcount_at(&parent, va), 1);
}
