fn main() {
    #[cfg(feature = "cuda")]
    {
        use cuda_builder::CudaBuilder;

        println!("cargo:rerun-if-changed=../buffer_ops_gpu/src");

        CudaBuilder::new("../buffer_ops_gpu")
            .copy_to("../resources/buffer_ops_gpu.ptx")
            .build()
            .unwrap();
    }
}
