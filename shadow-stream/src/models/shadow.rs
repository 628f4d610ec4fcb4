/// A stored shadow state value.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StoredValue {
    /// The JSON encoded state.
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    /// The unix timestamp in milliseconds after which this value is expired, `0` if it never expires.
    #[prost(int64, tag = "2")]
    pub expires_at: i64,
}
