use tailpipe_types::{Column, ReadOnlyLogEntry, Value};

/// Fixed-size transfer buffer used by the bulk read APIs
#[derive(Clone, Debug)]
pub struct LogBufferArray {
    columns: Vec<Column>,

    /// `cells[c][row]` holds the value of `columns[c]`
    cells: Vec<Vec<Value>>,

    len: usize,
}

impl LogBufferArray {
    /// Preallocate `len` rows of default values
    pub fn new(len: usize, columns: impl IntoIterator<Item = Column>) -> Self {
        let mut unique: Vec<Column> = Vec::new();
        for column in columns {
            if !unique.contains(&column) {
                unique.push(column);
            }
        }
        let cells = unique
            .iter()
            .map(|column| vec![column.default_value(); len])
            .collect();
        Self {
            columns: unique,
            cells,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn columns(&self) -> Vec<Column> {
        self.columns.clone()
    }

    pub fn contains(&self, column: Column) -> bool {
        self.position(column).is_some()
    }

    pub fn get(&self, index: usize) -> Option<ArrayEntry<'_>> {
        (index < self.len).then_some(ArrayEntry { array: self, index })
    }

    pub fn iter(&self) -> impl Iterator<Item = ArrayEntry<'_>> {
        (0..self.len).map(move |index| ArrayEntry { array: self, index })
    }

    pub fn value(&self, column: Column, index: usize) -> Value {
        self.position(column)
            .and_then(|c| self.cells[c].get(index).cloned())
            .unwrap_or_else(|| column.default_value())
    }

    pub fn set_value(&mut self, column: Column, index: usize, value: Value) {
        if !column.accepts(&value) {
            return;
        }
        if let Some(slot) = self
            .position(column)
            .and_then(|c| self.cells[c].get_mut(index))
        {
            *slot = value;
        }
    }

    /// Cells of `column` from row `start` to the end of the array
    pub fn column_mut(&mut self, column: Column, start: usize) -> Option<&mut [Value]> {
        let c = self.position(column)?;
        self.cells[c].get_mut(start..)
    }

    /// All cells of `column`
    pub fn column(&self, column: Column) -> Option<&[Value]> {
        self.position(column).map(|c| self.cells[c].as_slice())
    }

    /// Reset `len` rows of `column` starting at `start` to the column default
    pub fn fill_default(&mut self, column: Column, start: usize, len: usize) {
        if let Some(cells) = self.column_mut(column, start) {
            for cell in cells.iter_mut().take(len) {
                *cell = column.default_value();
            }
        }
    }

    /// Reset every column of `len` rows starting at `start`
    pub fn fill_all_default(&mut self, start: usize, len: usize) {
        for column in self.columns() {
            self.fill_default(column, start, len);
        }
    }

    /// Overwrite row `index` with the values of `entry`
    pub fn copy_from_entry(&mut self, index: usize, entry: &dyn ReadOnlyLogEntry) {
        for column in self.columns() {
            self.set_value(column, index, entry.get_value(column));
        }
    }

    fn position(&self, column: Column) -> Option<usize> {
        self.columns.iter().position(|c| *c == column)
    }
}

/// A row of a [`LogBufferArray`]
#[derive(Clone, Copy)]
pub struct ArrayEntry<'a> {
    array: &'a LogBufferArray,
    index: usize,
}

impl ReadOnlyLogEntry for ArrayEntry<'_> {
    fn columns(&self) -> Vec<Column> {
        self.array.columns()
    }

    fn try_get_value(&self, column: Column) -> Option<Value> {
        self.array
            .position(column)
            .and_then(|c| self.array.cells[c].get(self.index).cloned())
    }
}
