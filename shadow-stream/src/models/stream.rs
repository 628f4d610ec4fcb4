/// A record of a topic partition.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Record {
    /// The offset of this record within its partition.
    #[prost(uint64, tag = "1")]
    pub offset: u64,
    /// The key of this record, typically a device ID.
    #[prost(string, tag = "2")]
    pub key: ::prost::alloc::string::String,
    /// The data payload of this record.
    #[prost(bytes = "vec", tag = "3")]
    pub value: ::prost::alloc::vec::Vec<u8>,
    /// The unix timestamp in milliseconds at which this record was written.
    #[prost(int64, tag = "4")]
    pub timestamp: i64,
}

/// The metadata of a topic.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TopicMetadata {
    /// The name of the topic.
    #[prost(string, tag = "1")]
    pub name: ::prost::alloc::string::String,
    /// The number of partitions of the topic.
    #[prost(uint32, tag = "2")]
    pub partitions: u32,
    /// Whether the topic only retains the latest record of each key.
    #[prost(bool, tag = "3")]
    pub compacted: bool,
}
