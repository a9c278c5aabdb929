fn main() {
    stridelink_lib::run()
}
