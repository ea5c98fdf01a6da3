use tailpipe_types::{Column, LogLineIndex, ReadOnlyLogEntry, Value};

use super::LogBufferArray;
use super::column::ColumnStore;

/// Growable column-major store of log entries
#[derive(Clone, Debug)]
pub struct LogBufferList {
    /// One store per column, all of the same length
    stores: Vec<ColumnStore>,

    /// Number of rows
    count: usize,
}

impl LogBufferList {
    /// Create an empty list holding the given columns
    pub fn new(columns: impl IntoIterator<Item = Column>) -> Self {
        let mut stores: Vec<ColumnStore> = Vec::new();
        for column in columns {
            if !stores.iter().any(|s| s.column == column) {
                stores.push(ColumnStore::new(column));
            }
        }
        Self { stores, count: 0 }
    }

    pub fn columns(&self) -> Vec<Column> {
        self.stores.iter().map(|s| s.column).collect()
    }

    pub fn contains(&self, column: Column) -> bool {
        self.store(column).is_some()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Borrowed view of row `index`
    pub fn get(&self, index: usize) -> Option<ListEntry<'_>> {
        (index < self.count).then_some(ListEntry { list: self, index })
    }

    pub fn last(&self) -> Option<ListEntry<'_>> {
        self.count.checked_sub(1).and_then(|index| self.get(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = ListEntry<'_>> {
        (0..self.count).map(move |index| ListEntry { list: self, index })
    }

    /// Value of `column` at row `index`; the column default when either doesn't exist
    pub fn value(&self, column: Column, index: usize) -> Value {
        match self.store(column) {
            Some(store) if index < self.count => store.value(index),
            _ => column.default_value(),
        }
    }

    /// Overwrite a single cell; ignored for unknown columns or rows
    pub fn set_value(&mut self, column: Column, index: usize, value: Value) {
        if index >= self.count {
            return;
        }
        if let Some(store) = self.store_mut(column) {
            store.set(index, value);
        }
    }

    /// Append a row; columns the entry doesn't carry are default-filled
    pub fn add(&mut self, entry: &dyn ReadOnlyLogEntry) {
        let index = self.count;
        self.insert(index, entry);
    }

    /// Append `count` rows of default values
    pub fn add_empty(&mut self, count: usize) {
        self.resize(self.count + count);
    }

    /// Insert a row at `index`, shifting later rows back
    pub fn insert(&mut self, index: usize, entry: &dyn ReadOnlyLogEntry) {
        let index = index.min(self.count);
        for store in &mut self.stores {
            store.insert(index, entry.get_value(store.column));
        }
        self.count += 1;
    }

    pub fn insert_empty(&mut self, index: usize) {
        let index = index.min(self.count);
        for store in &mut self.stores {
            store.insert(index, store.column.default_value());
        }
        self.count += 1;
    }

    pub fn remove_at(&mut self, index: usize) {
        self.remove_range(index, 1);
    }

    /// Remove up to `count` rows starting at `index`
    pub fn remove_range(&mut self, index: usize, count: usize) {
        if index >= self.count {
            return;
        }
        let end = (index + count).min(self.count);
        for store in &mut self.stores {
            store.remove_range(index..end);
        }
        self.count -= end - index;
    }

    /// Drop every row from `len` onward
    pub fn truncate(&mut self, len: usize) {
        if len >= self.count {
            return;
        }
        for store in &mut self.stores {
            store.truncate(len);
        }
        self.count = len;
    }

    /// Grow with default rows or shrink to `count`
    pub fn resize(&mut self, count: usize) {
        for store in &mut self.stores {
            store.resize(count);
        }
        self.count = count;
    }

    pub fn clear(&mut self) {
        for store in &mut self.stores {
            store.clear();
        }
        self.count = 0;
    }

    /// Reset `len` rows starting at `index` to default values
    pub fn fill_default(&mut self, index: usize, len: usize) {
        let end = (index + len).min(self.count);
        for store in &mut self.stores {
            store.fill_default(index..end);
        }
    }

    /// Copy `column` for the given rows into `destination`; missing rows yield the default
    pub fn copy_to(&self, column: Column, indices: &[LogLineIndex], destination: &mut [Value]) {
        let store = self.store(column);
        for (slot, index) in destination.iter_mut().zip(indices) {
            *slot = match (store, index.as_usize()) {
                (Some(store), Some(index)) if index < self.count => store.value(index),
                _ => column.default_value(),
            };
        }
    }

    /// Copy the given rows into `destination` starting at `destination_index`.
    ///
    /// Columns of the array this list doesn't hold are default-filled.
    pub fn copy_rows_to(
        &self,
        indices: &[LogLineIndex],
        destination: &mut LogBufferArray,
        destination_index: usize,
    ) {
        for column in destination.columns() {
            if let Some(slots) = destination.column_mut(column, destination_index) {
                self.copy_to(column, indices, slots);
            }
        }
    }

    /// Overwrite `column` from `values`, starting at row `index`
    pub fn copy_from(&mut self, column: Column, index: usize, values: &[Value]) {
        let count = self.count;
        if let Some(store) = self.store_mut(column) {
            for (offset, value) in values.iter().enumerate() {
                let row = index + offset;
                if row >= count {
                    break;
                }
                store.set(row, value.clone());
            }
        }
    }

    fn store(&self, column: Column) -> Option<&ColumnStore> {
        self.stores.iter().find(|s| s.column == column)
    }

    fn store_mut(&mut self, column: Column) -> Option<&mut ColumnStore> {
        self.stores.iter_mut().find(|s| s.column == column)
    }
}

/// A row of a [`LogBufferList`]
#[derive(Clone, Copy)]
pub struct ListEntry<'a> {
    list: &'a LogBufferList,
    index: usize,
}

impl ListEntry<'_> {
    /// Position of this row within the list
    pub fn position(&self) -> usize {
        self.index
    }
}

impl ReadOnlyLogEntry for ListEntry<'_> {
    fn columns(&self) -> Vec<Column> {
        self.list.columns()
    }

    fn try_get_value(&self, column: Column) -> Option<Value> {
        self.list.store(column).and_then(|s| s.get(self.index))
    }
}
