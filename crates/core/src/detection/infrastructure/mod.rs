pub mod coco_classes;
pub mod model_resolver;
pub mod onnx_yolo_detector;
