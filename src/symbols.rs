//! Kernel symbol table (`spec.md §4.7`): registration/lookup by name, a
//! boot-time map-file parser, and the reverse (address→symbol) resolver the
//! exception-fatal path uses for its stack trace. Grounded on
//! `original_source/core/drivers/SymbolTable.cpp` (`Register`/`Lookup`, the
//! 1024-entry/64-byte-name bounds) and `core/KernelSymbolResolver.cpp`
//! (`PrintStackTrace`'s closest-not-exceeding search and sanity bound).
use crate::config::{MAX_KERNEL_SYMBOLS, MAX_SYMBOL_NAME_LEN, STACK_WALK_HIGH, STACK_WALK_LOW, SYMBOL_OFFSET_SANITY_BOUND};
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use spin::Mutex;

#[derive(Clone)]
struct Symbol {
    name: String,
    address: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SymbolError {
    TableFull,
    NameTooLong,
}

pub struct SymbolTable(Mutex<Vec<Symbol>>);

impl SymbolTable {
    pub const fn new() -> Self {
        SymbolTable(Mutex::new(Vec::new()))
    }

    /// Registers `name` at `address`. Rejects a name longer than
    /// `MAX_SYMBOL_NAME_LEN` or a table already at `MAX_KERNEL_SYMBOLS`
    /// entries.
    pub fn register(&self, name: &str, address: usize) -> Result<(), SymbolError> {
        if name.len() > MAX_SYMBOL_NAME_LEN {
            return Err(SymbolError::NameTooLong);
        }
        let mut table = self.0.lock();
        if table.len() >= MAX_KERNEL_SYMBOLS {
            return Err(SymbolError::TableFull);
        }
        table.push(Symbol { name: name.to_string(), address });
        Ok(())
    }

    /// Exact-name lookup.
    pub fn lookup(&self, name: &str) -> Option<usize> {
        self.0.lock().iter().find(|s| s.name == name).map(|s| s.address)
    }

    /// The registered symbol whose address is the closest one not
    /// exceeding `addr`, provided the offset is within
    /// `SYMBOL_OFFSET_SANITY_BOUND` (an unrelated, far-away symbol is worse
    /// than none at all).
    pub fn resolve_address(&self, addr: usize) -> Option<(String, usize)> {
        let table = self.0.lock();
        table
            .iter()
            .filter(|s| s.address <= addr && addr - s.address <= SYMBOL_OFFSET_SANITY_BOUND)
            .max_by_key(|s| s.address)
            .map(|s| (s.name.clone(), addr - s.address))
    }

    /// One line of the map file format `spec.md §6` specifies:
    /// `0xHHHHHHHH<whitespace>NAME`. Unparseable lines are skipped rather
    /// than aborting the whole file.
    pub fn load_map_file(&self, contents: &str) {
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let (Some(addr_str), Some(name)) = (fields.next(), fields.next()) else {
                continue;
            };
            let addr_str = addr_str.strip_prefix("0x").or(addr_str.strip_prefix("0X")).unwrap_or(addr_str);
            if let Ok(addr) = usize::from_str_radix(addr_str, 16) {
                let _ = self.register(name, addr);
            }
        }
    }
}

/// The kernel-wide symbol table, built up during boot by registering
/// asm-exported symbols and (once a filesystem collaborator exists)
/// loading a map file.
pub static SYMBOLS: SymbolTable = SymbolTable::new();

/// Walks the frame-pointer chain starting at `ebp`, yielding `(return_eip,
/// "symbol+offset")` pairs for the exception-fatal path's stack trace.
/// Terminates when a frame pointer falls outside
/// `[STACK_WALK_LOW, STACK_WALK_HIGH)` or the chain does not advance.
pub fn walk_stack(ebp: u32) -> impl Iterator<Item = (u32, String)> {
    StackWalker { ebp: ebp as usize }
}

struct StackWalker {
    ebp: usize,
}

impl Iterator for StackWalker {
    type Item = (u32, String);

    fn next(&mut self) -> Option<Self::Item> {
        if self.ebp < STACK_WALK_LOW || self.ebp >= STACK_WALK_HIGH {
            return None;
        }

        let saved_ebp = unsafe { (self.ebp as *const u32).read() };
        let return_eip = unsafe { ((self.ebp + 4) as *const u32).read() };

        if saved_ebp as usize <= self.ebp {
            return None; // the chain must strictly ascend; otherwise it's corrupt or we're done
        }
        self.ebp = saved_ebp as usize;

        let label = match SYMBOLS.resolve_address(return_eip as usize) {
            Some((name, 0)) => name,
            Some((name, offset)) => alloc::format!("{name}+{offset:#x}"),
            None => "???".to_string(),
        };

        Some((return_eip, label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_lookup_round_trips() {
        let table = SymbolTable::new();
        table.register("kmain", 0x1000).unwrap();
        assert_eq!(table.lookup("kmain"), Some(0x1000));
    }

    #[test]
    fn resolve_address_picks_closest_not_exceeding() {
        let table = SymbolTable::new();
        table.register("a_func", 0x2000).unwrap();
        table.register("b_func", 0x2100).unwrap();
        let (name, offset) = table.resolve_address(0x2110).unwrap();
        assert_eq!(name, "b_func");
        assert_eq!(offset, 0x10);
    }

    #[test]
    fn resolve_address_rejects_far_offsets() {
        let table = SymbolTable::new();
        table.register("far_func", 0x3000).unwrap();
        assert!(table.resolve_address(0x3000 + SYMBOL_OFFSET_SANITY_BOUND + 1).is_none());
    }

    #[test]
    fn map_file_parses_address_name_pairs() {
        let table = SymbolTable::new();
        table.load_map_file("0x00100000 kmain\n0x00100040 pmm_init\nnot a valid line\n");
        assert_eq!(table.lookup("kmain"), Some(0x00100000));
        assert_eq!(table.lookup("pmm_init"), Some(0x00100040));
    }

    #[test]
    fn name_too_long_is_rejected() {
        let table = SymbolTable::new();
        let long_name: alloc::string::String = "x".repeat(MAX_SYMBOL_NAME_LEN + 1);
        assert_eq!(table.register(&long_name, 0x10), Err(SymbolError::NameTooLong));
    }
}
