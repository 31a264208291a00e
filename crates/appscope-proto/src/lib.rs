pub mod appscope {
    pub mod v1 {
        tonic::include_proto!("appscope.v1");
    }
}
