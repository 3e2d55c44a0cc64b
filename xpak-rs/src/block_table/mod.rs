pub(crate) mod block_table_encoder_type;
pub(crate) mod block_table_entry;
pub(crate) mod block_table_header;
