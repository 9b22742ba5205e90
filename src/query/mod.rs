//! Query engine: projection, filtering, searching, sorting, pagination
//! over the merged source + enrichment view.

pub mod engine;
pub mod options;

pub use options::{
    BinaryOp, Column, Filter, ListOp, Search, SelectRowsOptions, SelectRowsSchema, SelectedRow,
    SortOrder, UnaryOp,
};
