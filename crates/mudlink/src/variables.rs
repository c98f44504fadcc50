//! 變數系統
//!
//! 每個工作階段有自己的 `VariableStore`；`GlobalVariables` 由所有工作階段共用，
//! 以讀寫鎖保護，寫入時後寫者為準，讀取不會看到寫到一半的值。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use crate::value::Value;

/// 暫存變數的名稱前綴，這類變數不會被存檔
///
/// `%` 開頭的是系統變數（`%line`、`%raw`、`%1` 等），`_` 開頭的是使用者的暫存變數。
pub const TEMP_PREFIXES: [char; 2] = ['%', '_'];

/// 依名稱判斷是否為暫存變數
pub fn is_temporary_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIXES)
}

/// 單一變數
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    value: Value,
    temporary: bool,
}

impl Variable {
    /// 建立變數，暫存旗標只在此時由名稱決定一次
    pub fn new(name: &str, value: Value) -> Self {
        Self {
            value,
            temporary: is_temporary_name(name),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }
}

/// 變數表
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    vars: HashMap<String, Variable>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 設定變數，已存在的變數保留原本的暫存旗標
    pub fn set(&mut self, name: &str, value: Value) {
        match self.vars.get_mut(name) {
            Some(var) => var.value = value,
            None => {
                self.vars.insert(name.to_string(), Variable::new(name, value));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name).map(|v| &v.value)
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.vars.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.vars.remove(name).map(|v| v.value)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// 依名稱排序的所有變數
    pub fn sorted(&self) -> Vec<(String, Variable)> {
        let mut list: Vec<_> = self
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        list.sort_by(|a, b| a.0.cmp(&b.0));
        list
    }

    /// 需要存檔的變數（排除暫存變數）
    pub fn persistent(&self) -> BTreeMap<String, Value> {
        self.vars
            .iter()
            .filter(|(_, v)| !v.temporary)
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect()
    }

    /// 載入存檔內容，覆蓋同名變數
    pub fn load(&mut self, values: BTreeMap<String, Value>) {
        for (name, value) in values {
            self.set(&name, value);
        }
    }
}

/// 跨工作階段共用的全域變數
#[derive(Debug, Clone, Default)]
pub struct GlobalVariables {
    inner: Arc<RwLock<VariableStore>>,
}

impl GlobalVariables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let store = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        store.get(name).cloned()
    }

    pub fn set(&self, name: &str, value: Value) {
        let mut store = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        store.set(name, value);
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        let mut store = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        store.remove(name)
    }

    pub fn sorted(&self) -> Vec<(String, Variable)> {
        let store = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        store.sorted()
    }
}

/// 命令展開時查詢變數的介面
pub trait VarLookup {
    fn lookup(&self, name: &str) -> Option<Value>;
}

/// 先查工作階段變數，找不到再查全域變數
pub struct Scope<'a> {
    pub session: &'a VariableStore,
    pub global: &'a GlobalVariables,
}

impl VarLookup for Scope<'_> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.session
            .get(name)
            .cloned()
            .or_else(|| self.global.get(name))
    }
}

impl VarLookup for VariableStore {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_flag_from_name() {
        let mut store = VariableStore::new();
        store.set("%line", Value::from("hi"));
        store.set("gold", Value::Int(5));
        assert!(store.variable("%line").unwrap().is_temporary());
        assert!(!store.variable("gold").unwrap().is_temporary());
        assert!(is_temporary_name("_target"));
        assert!(!is_temporary_name("a_b"));
    }

    #[test]
    fn test_persistent_excludes_temporary() {
        let mut store = VariableStore::new();
        store.set("%1", Value::from("x"));
        store.set("%raw", Value::from("\x1b[31mx"));
        store.set("_tmp", Value::Int(3));
        store.set("hp", Value::Int(100));
        let saved = store.persistent();
        assert!(!saved.contains_key("_tmp"));
        assert_eq!(saved.len(), 1);
        assert_eq!(saved.get("hp"), Some(&Value::Int(100)));
    }

    #[test]
    fn test_overwrite_keeps_type() {
        let mut store = VariableStore::new();
        store.set("gold", Value::infer("500"));
        assert_eq!(store.get("gold"), Some(&Value::Int(500)));
        store.set("gold", Value::infer("lots"));
        assert_eq!(store.get("gold"), Some(&Value::from("lots")));
    }

    #[test]
    fn test_scope_falls_back_to_global() {
        let global = GlobalVariables::new();
        global.set("realm", Value::from("north"));
        let mut session = VariableStore::new();
        session.set("hp", Value::Int(1));
        let scope = Scope {
            session: &session,
            global: &global,
        };
        assert_eq!(scope.lookup("realm"), Some(Value::from("north")));
        assert_eq!(scope.lookup("hp"), Some(Value::Int(1)));
        assert_eq!(scope.lookup("none"), None);
    }

    #[test]
    fn test_global_is_shared_between_clones() {
        let a = GlobalVariables::new();
        let b = a.clone();
        a.set("x", Value::Int(1));
        assert_eq!(b.get("x"), Some(Value::Int(1)));
        assert_eq!(b.remove("x"), Some(Value::Int(1)));
        assert_eq!(a.get("x"), None);
    }

    #[test]
    fn test_concurrent_global_writes() {
        let globals = GlobalVariables::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let g = globals.clone();
                std::thread::spawn(move || {
                    for n in 0..100 {
                        g.set("counter", Value::Int(i * 1000 + n));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(matches!(globals.get("counter"), Some(Value::Int(_))));
    }
}
