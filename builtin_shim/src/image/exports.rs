// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Export tables and their image form
//!
//! The directory declares its own function and name counts. The function
//! array holds one address per exported function; the name array and the
//! ordinal array run in parallel, one slot per exported name, each ordinal
//! indexing the function array.

use super::layout::{DataDirectory, ExportDirectory};
use super::writer::AreaWriter;
use crate::{BridgeError, Result};
use core::mem::offset_of;
use std::ffi::CStr;
use std::sync::Arc;

/// Export tables of a module template, with absolute addresses
#[derive(Debug, Clone)]
pub struct ExportTables {
    module_name: &'static CStr,
    ordinal_base: u32,
    functions: Arc<[usize]>,
    names: Arc<[&'static CStr]>,
    ordinals: Arc<[u16]>,
}

fn count(len: usize, what: &str) -> Result<u32> {
    u32::try_from(len).map_err(|_| BridgeError::InvalidExports(format!("too many {what}")))
}

impl ExportTables {
    /// Build export tables
    ///
    /// `names` and `ordinals` run in parallel; every ordinal must index
    /// `functions`. Function addresses are only ever offset, never read.
    pub fn new(
        module_name: &'static CStr,
        ordinal_base: u32,
        functions: &[usize],
        names: &[&'static CStr],
        ordinals: &[u16],
    ) -> Result<Self> {
        if names.len() != ordinals.len() {
            return Err(BridgeError::InvalidExports(format!(
                "{} names but {} ordinals",
                names.len(),
                ordinals.len()
            )));
        }
        if let Some(bad) = ordinals.iter().find(|&&o| usize::from(o) >= functions.len()) {
            return Err(BridgeError::InvalidExports(format!(
                "ordinal {bad} out of range for {} functions",
                functions.len()
            )));
        }
        count(functions.len(), "functions")?;
        count(names.len(), "names")?;

        Ok(Self {
            module_name,
            ordinal_base,
            functions: functions.into(),
            names: names.into(),
            ordinals: ordinals.into(),
        })
    }

    pub fn module_name(&self) -> &'static CStr {
        self.module_name
    }

    pub fn ordinal_base(&self) -> u32 {
        self.ordinal_base
    }

    /// Absolute function addresses
    pub fn functions(&self) -> &[usize] {
        &self.functions
    }

    pub fn names(&self) -> &[&'static CStr] {
        &self.names
    }

    /// Function indices parallel to [`ExportTables::names`]
    pub fn ordinals(&self) -> &[u16] {
        &self.ordinals
    }

    /// Lay out the export directory and its three arrays in `area`
    ///
    /// The function array is sized by the function count, the name and
    /// ordinal arrays by the name count. Function, name and module-name
    /// addresses become offsets from the base; ordinals are indices and are
    /// copied unchanged.
    pub(crate) fn write(&self, area: &mut AreaWriter) -> Result<DataDirectory> {
        area.align(align_of::<ExportDirectory>());
        let start = area.push(&ExportDirectory::default());
        let functions = area.reserve::<u32>(self.functions.len());
        let names = area.reserve::<u32>(self.names.len());
        let ordinals = area.push(&self.ordinals[..]);
        area.align(align_of::<u32>());

        for (index, &function) in self.functions.iter().enumerate() {
            area.fixup_rva(functions + index * size_of::<u32>(), function);
        }
        for (index, name) in self.names.iter().enumerate() {
            area.fixup_rva(names + index * size_of::<u32>(), name.as_ptr() as usize);
        }
        area.fixup_rva(
            start + offset_of!(ExportDirectory, name),
            self.module_name.as_ptr() as usize,
        );

        let array_rva = |area: &AreaWriter, position: usize, len: usize| {
            if len == 0 { Ok(0) } else { area.rva(position) }
        };
        let directory = ExportDirectory {
            base: self.ordinal_base,
            number_of_functions: count(self.functions.len(), "functions")?,
            number_of_names: count(self.names.len(), "names")?,
            address_of_functions: array_rva(area, functions, self.functions.len())?,
            address_of_names: array_rva(area, names, self.names.len())?,
            address_of_name_ordinals: array_rva(area, ordinals, self.ordinals.len())?,
            ..ExportDirectory::default()
        };
        area.overwrite(start, &directory);

        Ok(DataDirectory {
            virtual_address: area.rva(start)?,
            size: u32::try_from(area.len() - start)
                .map_err(|_| BridgeError::ImageTooLarge(area.len()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::FromBytes;

    /// Function addresses near the name strings, as in a real module
    fn function_addresses() -> [usize; 3] {
        let anchor = c"sample.dll".as_ptr() as usize;
        [anchor + 0x1000, anchor + 0x2000, anchor + 0x3000]
    }

    fn tables() -> ExportTables {
        ExportTables::new(
            c"sample.dll",
            1,
            &function_addresses(),
            &[c"Alpha", c"Beta", c"Gamma", c"Delta", c"Epsilon"],
            &[0, 1, 2, 2, 0],
        )
        .unwrap()
    }

    #[test]
    fn test_mismatched_ordinals_rejected() {
        let result = ExportTables::new(c"x.dll", 1, &[0x1000], &[c"A", c"B"], &[0]);
        assert!(matches!(result, Err(BridgeError::InvalidExports(_))));
    }

    #[test]
    fn test_ordinal_out_of_range_rejected() {
        let result = ExportTables::new(c"x.dll", 1, &[0x1000], &[c"A"], &[1]);
        assert!(matches!(result, Err(BridgeError::InvalidExports(_))));
    }

    #[test]
    fn test_write_honours_both_counts() {
        let tables = tables();
        let mut area = AreaWriter::new(0x200);
        let entry = tables.write(&mut area).unwrap();
        assert_eq!(entry.virtual_address, 0x200);
        // Directory, 3 function offsets, 5 name offsets, 5 ordinals, padding.
        assert_eq!(entry.size, 40 + 12 + 20 + 12);

        let base = area.lowest_target().unwrap() & !0xfff;
        let bytes = area.resolve(base).unwrap();
        let (directory, rest) = ExportDirectory::read_from_prefix(&bytes).unwrap();
        assert_eq!(directory.base, 1);
        assert_eq!(directory.number_of_functions, 3);
        assert_eq!(directory.number_of_names, 5);
        assert_eq!(directory.address_of_functions, 0x200 + 40);
        assert_eq!(directory.address_of_names, 0x200 + 52);
        assert_eq!(directory.address_of_name_ordinals, 0x200 + 72);
        assert_eq!(
            directory.name as usize,
            tables.module_name().as_ptr() as usize - base
        );

        let (functions, rest) = <[u32; 3]>::read_from_prefix(rest).unwrap();
        let expected = function_addresses().map(|address| (address - base) as u32);
        assert_eq!(functions, expected);
        let (names, rest) = <[u32; 5]>::read_from_prefix(rest).unwrap();
        for (rva, name) in names.iter().zip(tables.names()) {
            assert_eq!(*rva as usize, name.as_ptr() as usize - base);
        }
        let (ordinals, _) = <[u16; 5]>::read_from_prefix(rest).unwrap();
        assert_eq!(ordinals, [0, 1, 2, 2, 0]);
    }

    #[test]
    fn test_empty_arrays_are_null() {
        let tables = ExportTables::new(c"none.dll", 1, &[], &[], &[]).unwrap();
        let mut area = AreaWriter::new(0x200);
        tables.write(&mut area).unwrap();
        let bytes = area.resolve(area.lowest_target().unwrap()).unwrap();
        let (directory, _) = ExportDirectory::read_from_prefix(&bytes).unwrap();
        assert_eq!(directory.address_of_functions, 0);
        assert_eq!(directory.address_of_names, 0);
        assert_eq!(directory.address_of_name_ordinals, 0);
    }
}
