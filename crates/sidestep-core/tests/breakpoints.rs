//! Breakpoint registry behavior against the mock backend.

mod common;

use common::*;
use sidestep_core::breakpoints::{BreakpointHandle, BreakpointKind};
use sidestep_core::{BreakpointBuilder, BreakpointManager, DebuggerError, ThreadGroup, ThreadId};

const OTHER: ThreadId = ThreadId(2);

#[test]
fn test_user_and_temporary_ownership()
{
    let process = MockProcess::program();
    let mut inferior = process.inferior(MAIN);
    let manager = BreakpointManager::new();

    let breakpoint = BreakpointBuilder::new(1).build();
    let user = manager
        .insert_breakpoint(inferior.as_mut(), Some(breakpoint), addr(HELPER_BODY), ThreadId(0))
        .unwrap();
    let temporary = manager.insert_temporary(inferior.as_mut(), addr(AFTER_HELPER), MAIN).unwrap();
    assert_ne!(user, temporary);

    let user_info = manager.info(user).unwrap();
    assert!(user_info.applies_to(MAIN));
    assert!(user_info.applies_to(OTHER));
    assert!(!user_info.temporary);

    let temporary_info = manager.info(temporary).unwrap();
    assert!(temporary_info.temporary);
    assert!(temporary_info.applies_to(MAIN));
    assert!(!temporary_info.applies_to(OTHER));
    assert_eq!(manager.lookup_by_address(addr(AFTER_HELPER)), Some((temporary, MAIN)));
    let (owner_breakpoint, enabled) = manager.lookup(temporary).unwrap();
    assert!(owner_breakpoint.is_none());
    assert!(enabled);

    let mut expected = vec![user, temporary];
    expected.sort();
    let listed: Vec<_> = manager.list().iter().map(|info| info.id).collect();
    assert_eq!(listed, expected);
}

#[test]
fn test_thread_group_limits_user_breakpoint()
{
    let process = MockProcess::program();
    let mut inferior = process.inferior(MAIN);
    let manager = BreakpointManager::new();
    let breakpoint = BreakpointBuilder::new(4).for_group(ThreadGroup::thread(OTHER)).build();

    let id = manager
        .insert_breakpoint(inferior.as_mut(), Some(breakpoint), addr(HELPER_BODY), ThreadId(0))
        .unwrap();
    let info = manager.info(id).unwrap();
    assert!(!info.applies_to(MAIN));
    assert!(info.applies_to(OTHER));
}

#[test]
fn test_enable_disable_and_lookup()
{
    let process = MockProcess::program();
    let mut inferior = process.inferior(MAIN);
    let manager = BreakpointManager::new();
    let first = manager.insert_temporary(inferior.as_mut(), addr(MAIN_BODY), MAIN).unwrap();
    let second = manager
        .insert_breakpoint(inferior.as_mut(), None, addr(MAIN_BODY), ThreadId(0))
        .unwrap();

    assert_eq!(manager.ids_at(addr(MAIN_BODY)).len(), 2);
    manager.disable_breakpoint(inferior.as_mut(), first).unwrap();
    // Disabling twice does not reach the backend again.
    manager.disable_breakpoint(inferior.as_mut(), first).unwrap();
    let disables = process
        .entries()
        .iter()
        .filter(|entry| entry.starts_with("disable"))
        .count();
    assert_eq!(disables, 1);

    assert_eq!(manager.enabled_at(addr(MAIN_BODY)), Some(second));
    assert_eq!(manager.lookup_by_address(addr(MAIN_BODY)), Some((second, ThreadId(0))));
    assert_eq!(manager.lookup(first).map(|(_, enabled)| enabled), Some(false));

    manager.disable_breakpoint(inferior.as_mut(), second).unwrap();
    assert_eq!(manager.enabled_at(addr(MAIN_BODY)), None);
    assert!(manager.lookup_by_address(addr(MAIN_BODY)).is_some());

    manager.enable_breakpoint(inferior.as_mut(), first).unwrap();
    assert_eq!(manager.enabled_at(addr(MAIN_BODY)), Some(first));

    let unknown = sidestep_core::BreakpointId::from_raw(999);
    assert!(matches!(
        manager.enable_breakpoint(inferior.as_mut(), unknown),
        Err(DebuggerError::NoSuchBreakpoint(id)) if id == unknown
    ));
}

#[test]
fn test_remove_breakpoints()
{
    let process = MockProcess::program();
    let mut inferior = process.inferior(MAIN);
    let manager = BreakpointManager::new();
    let id = manager.insert_temporary(inferior.as_mut(), addr(MAIN_BODY), MAIN).unwrap();

    manager.remove_breakpoint(inferior.as_mut(), id).unwrap();
    assert!(!manager.contains(id));
    assert!(manager.ids_at(addr(MAIN_BODY)).is_empty());
    assert!(process.breakpoints().is_empty());

    // Unknown ids are ignored.
    process.clear_log();
    manager.remove_breakpoint(inferior.as_mut(), id).unwrap();
    assert!(process.entries().is_empty());

    manager.insert_temporary(inferior.as_mut(), addr(MAIN_BODY), MAIN).unwrap();
    manager.insert_temporary(inferior.as_mut(), addr(HELPER_BODY), MAIN).unwrap();
    assert_eq!(manager.len(), 2);
    manager.remove_all(inferior.as_mut()).unwrap();
    assert!(manager.is_empty());
    assert!(process.breakpoints().is_empty());
}

#[test]
fn test_rejected_backend_id_is_undone()
{
    let process = MockProcess::program();
    let mut inferior = process.inferior(MAIN);
    let manager = BreakpointManager::new();

    process.set_next_breakpoint_id(0);
    let rejected = manager.insert_temporary(inferior.as_mut(), addr(MAIN_BODY), MAIN);
    assert!(matches!(rejected, Err(DebuggerError::Internal(_))));
    assert!(manager.is_empty());
    assert!(process.breakpoints().is_empty());
    assert_eq!(process.entries(), vec!["insert 0x1004 #0", "remove #0"]);

    // Handing out a registered id again must not disarm the registered breakpoint.
    let kept = manager.insert_temporary(inferior.as_mut(), addr(MAIN_BODY), MAIN).unwrap();
    process.set_next_breakpoint_id(kept.raw());
    let duplicate = manager.insert_temporary(inferior.as_mut(), addr(HELPER_BODY), MAIN);
    assert!(matches!(duplicate, Err(DebuggerError::Internal(_))));
    assert!(manager.contains(kept));
    assert!(!process.entries().contains(&format!("remove #{}", kept.raw())));
}

#[test]
fn test_hardware_breakpoints()
{
    let process = MockProcess::program();
    let mut inferior = process.inferior(MAIN);
    let manager = BreakpointManager::new();

    let id = manager
        .insert_hardware_breakpoint(inferior.as_mut(), None, addr(HELPER_BODY), 2)
        .unwrap();
    assert_eq!(manager.info(id).unwrap().kind, BreakpointKind::Hardware { index: 2 });
    assert_eq!(manager.info(id).unwrap().owner, ThreadId(0));

    let rejected = manager.insert_hardware_breakpoint(inferior.as_mut(), None, addr(HELPER_BODY), 4);
    assert!(matches!(rejected, Err(DebuggerError::InvalidArgument(_))));
    assert_eq!(manager.len(), 1);
}

#[test]
fn test_breakpoint_handle()
{
    let process = MockProcess::program();
    let mut inferior = process.inferior(MAIN);
    let manager = BreakpointManager::new();
    let breakpoint = BreakpointBuilder::new(5).named("main.c:2").build();

    let handle = BreakpointHandle::insert(&manager, inferior.as_mut(), breakpoint, addr(MAIN_BODY)).unwrap();
    assert_eq!(handle.address(), addr(MAIN_BODY));
    assert_eq!(handle.breakpoint().name(), "main.c:2");
    assert_eq!(manager.info(handle.id()).unwrap().owner, ThreadId(0));

    handle.remove(&manager, inferior.as_mut()).unwrap();
    assert!(manager.is_empty());
}

#[test]
fn test_catchpoints()
{
    let manager = BreakpointManager::new();
    assert!(!manager.has_catchpoints());

    let specific = manager.add_catchpoint(Some("System.IO.IOException".to_string())).unwrap();
    let any = manager.add_catchpoint(None).unwrap();
    assert_eq!((specific, any), (1, 2));

    let hit = manager.matching_catchpoint(Some("System.IO.IOException")).unwrap();
    assert_eq!(hit.index, specific);
    assert_eq!(manager.matching_catchpoint(Some("System.Exception")).unwrap().index, any);
    assert_eq!(manager.matching_catchpoint(None).unwrap().index, any);

    assert!(manager.remove_catchpoint(any).unwrap());
    assert!(!manager.remove_catchpoint(any).unwrap());
    assert!(manager.matching_catchpoint(Some("System.Exception")).is_none());
    assert!(manager.has_catchpoints());
}
