pub mod unit_row;

pub use unit_row::UnitRow;
