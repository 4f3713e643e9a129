/*!
API set redirection table

Virtual contract DLLs (api-ms-win-*, ext-ms-win-*) are mapped by the loader onto the real library
hosting them. The table shipped with Windows lives in the `.apiset` section of apisetschema.dll.

Resources:

* https://lucasg.github.io/2017/10/15/Api-set-resolution/
* https://www.geoffchappell.com/studies/windows/win32/apisetschema/index.htm

 */

use crate::common::ScanError;
use dataview::DataView;
use multimap::MultiMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One library implementing a contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiSetHost {
    pub name: String,
    /// Importing module this host applies to; empty for the default host
    #[serde(default)]
    pub alias: String,
}

impl ApiSetHost {
    pub fn new(name: &str, alias: &str) -> Self {
        Self {
            name: name.to_owned(),
            alias: alias.to_owned(),
        }
    }
}

/// Contract name -> host library, keyed by lowercase `.dll`-qualified contract name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiSetMap {
    map: HashMap<String, String>,
}

fn contract_key(name: &str) -> String {
    let lower = name.to_lowercase();
    if lower.ends_with(".dll") {
        lower
    } else {
        lower + ".dll"
    }
}

/// Default host if there is one, else the first listed
fn pick_host(hosts: &[ApiSetHost]) -> Option<&ApiSetHost> {
    hosts.iter().find(|h| h.alias.is_empty()).or_else(|| hosts.first())
}

impl ApiSetMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<ApiSetHost>)>,
        S: AsRef<str>,
    {
        let map = entries
            .into_iter()
            .filter_map(|(contract, hosts)| {
                let host = pick_host(&hosts)?;
                Some((contract_key(contract.as_ref()), host.name.clone()))
            })
            .collect();
        Self { map }
    }

    pub fn from_multimap(entries: &MultiMap<String, ApiSetHost>) -> Self {
        Self::from_entries(entries.iter_all().map(|(k, v)| (k, v.clone())))
    }

    /// Read a JSON object of the form `{"contract": [{"name": "host.dll", "alias": ""}]}`
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ScanError> {
        let content = fs_err::read_to_string(path.as_ref())?;
        let entries: HashMap<String, Vec<ApiSetHost>> = serde_json::from_str(&content)?;
        Ok(Self::from_entries(entries))
    }

    /// Read the table embedded in apisetschema.dll
    ///
    /// A file without an `.apiset` section gives an empty table.
    pub fn from_schema_file<P: AsRef<Path>>(apisetschema_path: P) -> Result<Self, ScanError> {
        let filemap = pelite::FileMap::open(apisetschema_path.as_ref())?;
        let pefile = pelite::PeFile::from_bytes(&filemap)?;
        match pefile.section_headers().by_name(".apiset") {
            Some(section) => {
                let bytes = pefile.get_section_bytes(section)?;
                Ok(Self::from_multimap(&parse_schema(bytes)?))
            }
            None => {
                tracing::warn!(
                    "{} has no .apiset section",
                    apisetschema_path.as_ref().display()
                );
                Ok(Self::new())
            }
        }
    }

    /// Host library for a contract name; the name itself if it is not a known contract
    pub fn resolve<'a>(&'a self, name: &'a str) -> &'a str {
        self.lookup(name).unwrap_or(name)
    }

    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.map.get(&contract_key(name)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

const SCHEMA_V6: u32 = 6;
const NAMESPACE_HEADER_SIZE: usize = 28;
const NAMESPACE_ENTRY_SIZE: usize = 24;
const VALUE_ENTRY_SIZE: usize = 20;

fn read_u32(view: &DataView, offset: usize) -> Result<u32, ScanError> {
    view.try_read::<u32>(offset)
        .map(u32::from_le)
        .ok_or_else(|| ScanError::ParseError(format!("apiset schema truncated at {offset:#x}")))
}

fn read_utf16(bytes: &[u8], offset: u32, length: u32) -> Result<String, ScanError> {
    let start = offset as usize;
    let end = start + length as usize;
    let raw = bytes.get(start..end).ok_or_else(|| {
        ScanError::ParseError(format!("apiset string out of bounds at {start:#x}"))
    })?;
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// Decode the contents of an `.apiset` section into contract -> hosts
///
/// Only schema version 6 (Windows 10 and later) is understood; other versions give an empty
/// table.
pub fn parse_schema(bytes: &[u8]) -> Result<MultiMap<String, ApiSetHost>, ScanError> {
    let view = DataView::from(bytes);
    let mut ret = MultiMap::new();

    let version = read_u32(view, 0)?;
    if version != SCHEMA_V6 {
        tracing::warn!("Unsupported apiset schema version {}", version);
        return Ok(ret);
    }
    if bytes.len() < NAMESPACE_HEADER_SIZE {
        return Err(ScanError::ParseError("apiset header truncated".to_owned()));
    }

    let count = read_u32(view, 12)? as usize;
    let entry_offset = read_u32(view, 16)? as usize;

    for i in 0..count {
        let entry = entry_offset + i * NAMESPACE_ENTRY_SIZE;
        let name_offset = read_u32(view, entry + 4)?;
        let name_length = read_u32(view, entry + 8)?;
        let value_offset = read_u32(view, entry + 16)? as usize;
        let value_count = read_u32(view, entry + 20)? as usize;

        let contract = read_utf16(bytes, name_offset, name_length)?.to_lowercase();
        if value_count == 0 {
            continue;
        }

        for j in 0..value_count {
            let value = value_offset + j * VALUE_ENTRY_SIZE;
            let alias_offset = read_u32(view, value + 4)?;
            let alias_length = read_u32(view, value + 8)?;
            let host_offset = read_u32(view, value + 12)?;
            let host_length = read_u32(view, value + 16)?;

            if host_length == 0 {
                continue;
            }
            let alias = if alias_length == 0 {
                String::new()
            } else {
                read_utf16(bytes, alias_offset, alias_length)?
            };
            let name = read_utf16(bytes, host_offset, host_length)?;
            ret.insert(contract.clone(), ApiSetHost { name, alias });
        }
    }

    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    /// Lays out a v6 namespace the way apisetschema.dll does: header, entries, values, strings
    struct SchemaBuilder {
        entries: Vec<(String, Vec<(String, String)>)>,
    }

    impl SchemaBuilder {
        fn build(&self) -> Vec<u8> {
            let value_total: usize = self.entries.iter().map(|(_, v)| v.len()).sum();
            let entries_start = NAMESPACE_HEADER_SIZE;
            let values_start = entries_start + self.entries.len() * NAMESPACE_ENTRY_SIZE;
            let strings_start = values_start + value_total * VALUE_ENTRY_SIZE;

            let mut out = vec![0u8; strings_start];
            let mut strings: Vec<u8> = Vec::new();
            let add_string = |s: &str, strings: &mut Vec<u8>| -> (u32, u32) {
                let offset = (strings_start + strings.len()) as u32;
                for unit in s.encode_utf16() {
                    strings.extend_from_slice(&unit.to_le_bytes());
                }
                (offset, (s.encode_utf16().count() * 2) as u32)
            };
            let put = |out: &mut Vec<u8>, at: usize, v: u32| {
                out[at..at + 4].copy_from_slice(&v.to_le_bytes());
            };

            put(&mut out, 0, SCHEMA_V6);
            put(&mut out, 12, self.entries.len() as u32);
            put(&mut out, 16, entries_start as u32);

            let mut value_index = 0;
            for (i, (contract, hosts)) in self.entries.iter().enumerate() {
                let entry = entries_start + i * NAMESPACE_ENTRY_SIZE;
                let (name_offset, name_length) = add_string(contract, &mut strings);
                put(&mut out, entry + 4, name_offset);
                put(&mut out, entry + 8, name_length);
                put(&mut out, entry + 16, (values_start + value_index * VALUE_ENTRY_SIZE) as u32);
                put(&mut out, entry + 20, hosts.len() as u32);
                for (host, alias) in hosts {
                    let value = values_start + value_index * VALUE_ENTRY_SIZE;
                    if !alias.is_empty() {
                        let (o, l) = add_string(alias, &mut strings);
                        put(&mut out, value + 4, o);
                        put(&mut out, value + 8, l);
                    }
                    let (o, l) = add_string(host, &mut strings);
                    put(&mut out, value + 12, o);
                    put(&mut out, value + 16, l);
                    value_index += 1;
                }
            }
            out.extend_from_slice(&strings);
            out
        }
    }

    fn owned(hosts: &[(&str, &str)]) -> Vec<(String, String)> {
        hosts
            .iter()
            .map(|(h, a)| (h.to_string(), a.to_string()))
            .collect()
    }

    #[test]
    fn decodes_v6_schema() -> Result<(), ScanError> {
        let schema = SchemaBuilder {
            entries: vec![
                (
                    "api-ms-win-core-synch-l1-2-0".to_owned(),
                    owned(&[("kernelbase.dll", "")]),
                ),
                (
                    "API-MS-Win-Core-Com-L1-1-0".to_owned(),
                    owned(&[("combase.dll", "ole32.dll"), ("kernelbase.dll", "")]),
                ),
                ("ext-ms-win-unhosted-l1-1-0".to_owned(), Vec::new()),
            ],
        }
        .build();

        let parsed = parse_schema(&schema)?;
        assert_eq!(
            parsed.get_vec("api-ms-win-core-com-l1-1-0"),
            Some(&vec![
                ApiSetHost::new("combase.dll", "ole32.dll"),
                ApiSetHost::new("kernelbase.dll", ""),
            ])
        );
        assert!(parsed.get_vec("ext-ms-win-unhosted-l1-1-0").is_none());

        let map = ApiSetMap::from_multimap(&parsed);
        assert_eq!(map.len(), 2);
        assert_eq!(map.resolve("api-ms-win-core-synch-l1-2-0.dll"), "kernelbase.dll");
        // the default host wins over the aliased one
        assert_eq!(map.resolve("api-ms-win-core-com-l1-1-0.dll"), "kernelbase.dll");
        Ok(())
    }

    #[test]
    fn other_schema_versions_give_empty_table() -> Result<(), ScanError> {
        let mut bytes = vec![0u8; NAMESPACE_HEADER_SIZE];
        bytes[0] = 4;
        assert!(parse_schema(&bytes)?.is_empty());
        Ok(())
    }

    #[test]
    fn truncated_schema_is_a_parse_error() {
        let mut schema = SchemaBuilder {
            entries: vec![(
                "api-ms-win-core-synch-l1-2-0".to_owned(),
                owned(&[("kernelbase.dll", "")]),
            )],
        }
        .build();
        schema.truncate(NAMESPACE_HEADER_SIZE + 8);
        assert!(matches!(
            parse_schema(&schema),
            Err(ScanError::ParseError(_))
        ));
    }

    #[test]
    fn lookup_is_case_insensitive_and_qualified() {
        let map = ApiSetMap::from_entries(vec![
            ("api-ms-win-crt-runtime-l1-1-0", vec![ApiSetHost::new("ucrtbase.dll", "")]),
            (
                "api-ms-win-aliased-only-l1-1-0",
                vec![ApiSetHost::new("first.dll", "a.dll"), ApiSetHost::new("second.dll", "b.dll")],
            ),
            ("api-ms-win-empty-l1-1-0", vec![]),
        ]);
        assert_eq!(map.resolve("API-MS-WIN-CRT-RUNTIME-L1-1-0.DLL"), "ucrtbase.dll");
        assert_eq!(map.resolve("api-ms-win-crt-runtime-l1-1-0"), "ucrtbase.dll");
        assert_eq!(map.resolve("api-ms-win-aliased-only-l1-1-0.dll"), "first.dll");
        assert_eq!(map.lookup("api-ms-win-empty-l1-1-0.dll"), None);
        assert_eq!(map.resolve("user32.dll"), "user32.dll");
    }

    #[test]
    fn loads_json_table() -> Result<(), ScanError> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            r#"{{
                "api-ms-win-core-heap-l1-1-0": [{{ "name": "kernelbase.dll" }}],
                "api-ms-win-security-base-l1-1-0": [
                    {{ "name": "sechost.dll", "alias": "advapi32.dll" }},
                    {{ "name": "kernelbase.dll", "alias": "" }}
                ]
            }}"#
        )?;

        let map = ApiSetMap::from_json_file(file.path())?;
        assert_eq!(map.resolve("api-ms-win-core-heap-l1-1-0.dll"), "kernelbase.dll");
        assert_eq!(map.resolve("api-ms-win-security-base-l1-1-0.dll"), "kernelbase.dll");
        Ok(())
    }
}
