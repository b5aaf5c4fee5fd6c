//! A small key-value state machine for running real clusters from the
//! command line.
//!
//! Commands are text: `set <key> <value>`, `del <key>`; queries are
//! `get <key>`. Snapshots carry the whole map.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use raftforge::Fsm;

#[derive(Debug, Default)]
pub struct KvStore {
    data: BTreeMap<String, String>,
}

impl Fsm for KvStore {
    fn apply(&mut self, data: &[u8]) -> Vec<u8> {
        let command = String::from_utf8_lossy(data);
        let mut parts = command.splitn(3, ' ');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("set"), Some(key), Some(value)) => {
                self.data.insert(key.to_string(), value.to_string());
                b"ok".to_vec()
            }
            (Some("del"), Some(key), None) => match self.data.remove(key) {
                Some(_) => b"ok".to_vec(),
                None => b"not found".to_vec(),
            },
            _ => b"bad command".to_vec(),
        }
    }

    fn read(&self, data: &[u8]) -> Vec<u8> {
        let query = String::from_utf8_lossy(data);
        let mut parts = query.splitn(2, ' ');
        match (parts.next(), parts.next()) {
            (Some("get"), Some(key)) => match self.data.get(key) {
                Some(value) => value.clone().into_bytes(),
                None => b"not found".to_vec(),
            },
            _ => b"bad query".to_vec(),
        }
    }

    fn snapshot(&self, sink: &mut dyn Write) -> std::io::Result<()> {
        for (key, value) in &self.data {
            writeln!(sink, "{key}\t{value}")?;
        }
        Ok(())
    }

    fn restore(&mut self, source: &mut dyn Read) -> std::io::Result<()> {
        let mut text = String::new();
        source.read_to_string(&mut text)?;
        self.data.clear();
        for line in text.lines() {
            if let Some((key, value)) = line.split_once('\t') {
                self.data.insert(key.to_string(), value.to_string());
            }
        }
        Ok(())
    }
}
