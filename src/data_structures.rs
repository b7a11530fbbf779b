pub mod bitmap_ref_mut;
