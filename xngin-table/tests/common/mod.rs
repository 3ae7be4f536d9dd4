#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use xngin_catalog::mem_impl::MemCatalog;
use xngin_catalog::types::DataType;
use xngin_catalog::{ColumnAttr, ColumnDef, TableSpec};
use xngin_mdl::{MdlConfig, MdlKey, MdlType};
use xngin_table::{lock_table_names, LockType, OpenFlags, Session, TableCacheConfig, TableList, TableManager};

pub const SCHEMA: &str = "db";

pub fn create_table(catalog: &MemCatalog, name: &str) {
    catalog
        .create_table(TableSpec::new(
            SCHEMA,
            name,
            vec![
                ColumnDef::new("id", DataType::I64, ColumnAttr::PK),
                ColumnDef::new("c1", DataType::I32, ColumnAttr::NULLABLE),
            ],
        ))
        .unwrap();
}

/// Catalog with schema `db` and tables t1, t2, t3, orders, audit_log
/// and users.
pub fn catalog() -> Arc<MemCatalog> {
    let catalog = Arc::new(MemCatalog::new());
    catalog.create_schema(SCHEMA).unwrap();
    for name in ["t1", "t2", "t3", "orders", "audit_log", "users"] {
        create_table(&catalog, name);
    }
    catalog
}

pub fn manager(catalog: &Arc<MemCatalog>) -> Arc<TableManager> {
    manager_with(catalog, TableCacheConfig::default())
}

pub fn manager_with(catalog: &Arc<MemCatalog>, config: TableCacheConfig) -> Arc<TableManager> {
    TableManager::new(catalog.clone(), config, MdlConfig::default())
}

pub fn tables(names: &[&str], lock: LockType) -> TableList {
    let mut list = TableList::new();
    for name in names {
        list.add_table(SCHEMA, name, None, lock);
    }
    list
}

/// Take exclusive metadata lock on the table, as DDL does.
pub fn lock_exclusive(session: &mut Session, name: &str) -> TableList {
    let mut list = TableList::new();
    let id = list.add_table(SCHEMA, name, None, LockType::Write);
    list.desc_mut(id).mdl_type = MdlType::Exclusive;
    lock_table_names(session, &mut list, OpenFlags::empty()).unwrap();
    list
}

/// Block until given number of requests are waiting on the lock.
pub fn wait_for_waiters(mgr: &TableManager, key: &MdlKey, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while mgr.mdl().lock_status(key).1 < n {
        assert!(Instant::now() < deadline, "no waiter on {}", key);
        thread::sleep(Duration::from_millis(5));
    }
}

pub fn table_key(name: &str) -> MdlKey {
    MdlKey::table(SCHEMA, name)
}
